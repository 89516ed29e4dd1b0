pub mod dtype;
pub mod loader;
pub mod writer;

pub use dtype::{OutputDtype, OutputImage};
pub use loader::ImageLoader;
pub use writer::TiffWriter;
