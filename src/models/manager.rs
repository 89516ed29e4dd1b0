use crate::models::{OnnxModel, SegmentationModel};
use crate::{Config, Result};
use serde::Serialize;

/// 按配置加载单模型或集成模型（每个fold一个）
pub struct ModelManager;

impl ModelManager {
    /// 加载配置中的全部模型；模型初始放在CPU上，由驱动按需迁移
    pub fn load_models(config: &Config) -> Result<Vec<Box<dyn SegmentationModel>>> {
        tracing::info!("Loading {} model(s)...", config.model_paths.len());

        let mut models: Vec<Box<dyn SegmentationModel>> = Vec::with_capacity(config.model_paths.len());
        for path in &config.model_paths {
            let model = OnnxModel::load(
                path,
                config.spatial_dims,
                &config.onnx_config,
                Default::default(),
            )?;
            models.push(Box::new(model));
        }

        tracing::info!("Models loaded successfully");
        Ok(models)
    }

    /// 获取模型统计信息
    pub fn stats(config: &Config, models: &[Box<dyn SegmentationModel>]) -> ModelStats {
        ModelStats {
            models: models.iter().map(|m| m.name().to_string()).collect(),
            spatial_dims: config.spatial_dims,
            device: config.device.to_string(),
            intra_threads: config.onnx_config.intra_threads,
            optimization_level: config.onnx_config.optimization_level,
        }
    }
}

/// 模型统计信息
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub models: Vec<String>,
    pub spatial_dims: usize,
    pub device: String,
    pub intra_threads: usize,
    pub optimization_level: i32,
}
