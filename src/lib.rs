pub mod config;
pub mod data;
pub mod image;
pub mod inference;
pub mod losses;
pub mod models;
pub mod utils;

// 重新导出主要类型
pub use config::{Config, Device};
pub use inference::InferencePipeline;
pub use utils::error::SegError;

pub type Result<T> = std::result::Result<T, SegError>;
