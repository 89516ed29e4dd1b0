use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported geometry: {0}")]
    Geometry(String),

    #[error("Incompatible dataset: {0}")]
    IncompatibleDataset(String),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Image processing failed: {0}")]
    ImageProcessing(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::Error),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SegError {
    pub fn error_code(&self) -> &'static str {
        match self {
            SegError::Config(_) => "CONFIG_ERROR",
            SegError::Geometry(_) => "GEOMETRY_ERROR",
            SegError::IncompatibleDataset(_) => "INCOMPATIBLE_DATASET",
            SegError::ModelLoad(_) => "MODEL_LOAD_ERROR",
            SegError::Inference(_) => "INFERENCE_ERROR",
            SegError::ImageProcessing(_) => "IMAGE_PROCESSING_ERROR",
            SegError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            SegError::Io(_) => "IO_ERROR",
            SegError::Json(_) => "JSON_ERROR",
            SegError::ImageDecode(_) => "IMAGE_DECODE_ERROR",
            SegError::Tiff(_) => "TIFF_ERROR",
            SegError::Ort(_) => "ORT_ERROR",
            SegError::Shape(_) => "SHAPE_ERROR",
            SegError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 配置、几何与数据集兼容性错误都在任何设备工作之前抛出
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            SegError::Config(_) | SegError::Geometry(_) | SegError::IncompatibleDataset(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(SegError::Config("x".into()).error_code(), "CONFIG_ERROR");
        assert_eq!(SegError::Geometry("x".into()).error_code(), "GEOMETRY_ERROR");
        assert!(SegError::IncompatibleDataset("x".into()).is_fail_fast());
        assert!(!SegError::Inference("x".into()).is_fail_fast());
    }

    #[test]
    fn messages_carry_context() {
        let err = SegError::Geometry("rank 6".to_string());
        assert_eq!(err.to_string(), "Unsupported geometry: rank 6");
    }
}
