pub mod manager;
pub mod model;
pub mod onnx;

pub use manager::{ModelManager, ModelStats};
pub use model::SegmentationModel;
pub use onnx::OnnxModel;
