pub mod geometry;
pub mod pipeline;
pub mod sliding_window;
pub mod steps;
pub mod transforms;
pub mod types;
pub mod voting;

pub use pipeline::InferencePipeline;
pub use sliding_window::SlidingWindowInferer;
pub use steps::{evaluate_step, predict_step, DiceMetric, StepContext, StepOutcome};
pub use transforms::{Argmax, Compose, Identity, PostTransform, Sigmoid, Softmax, Threshold};
pub use types::{EnsembleOptions, InferenceOptions, InferenceStage, InferenceStatus, RoiSize};
pub use voting::{Voting, VotingMechanism, Weights};
