use crate::inference::{EnsembleOptions, InferenceOptions};
use crate::utils::error::SegError;
use crate::Result;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    /// 模型文件路径（多个即为集成推理，每个fold一个）
    pub model_paths: Vec<PathBuf>,

    /// 模型的空间维度（2或3）
    pub spatial_dims: usize,

    /// 输入图像目录
    pub input_dir: PathBuf,

    /// 输出目录
    pub target_folder: PathBuf,

    /// 计算设备
    pub device: Device,

    /// 每个推理批次包含的图像数
    pub loader_batch_size: usize,

    /// ONNX Runtime配置
    pub onnx_config: OnnxConfig,

    /// 滑窗推理参数
    pub inference: InferenceOptions,

    /// 集成投票参数
    pub ensemble: EnsembleOptions,
}

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    /// CPU线程数
    pub intra_threads: usize,

    /// 优化级别
    pub optimization_level: i32,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        let cpu_cores = num_cpus::get();
        Self {
            intra_threads: (cpu_cores * 3 / 4).max(1), // 使用75%的CPU核心
            optimization_level: 3,
        }
    }
}

/// 参数文件内容，命令行参数优先
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptionsFile {
    #[serde(default)]
    pub inference: Option<InferenceOptions>,
    #[serde(default)]
    pub ensemble: Option<EnsembleOptions>,
}

impl OptionsFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options = serde_json::from_str(&content)?;
        Ok(options)
    }
}

impl Config {
    pub fn new(
        model_paths: Vec<PathBuf>,
        input_dir: impl Into<PathBuf>,
        target_folder: impl Into<PathBuf>,
        device: &str,
        spatial_dims: usize,
        loader_batch_size: usize,
    ) -> Result<Self> {
        if model_paths.is_empty() {
            return Err(SegError::Config("At least one model path is required".to_string()));
        }
        if spatial_dims != 2 && spatial_dims != 3 {
            return Err(SegError::Config(format!(
                "Spatial dimensions must be 2 or 3, got {}",
                spatial_dims
            )));
        }
        if loader_batch_size == 0 {
            return Err(SegError::Config("Batch size must be at least 1".to_string()));
        }

        Ok(Self {
            model_paths,
            spatial_dims,
            input_dir: input_dir.into(),
            target_folder: target_folder.into(),
            device: device.parse()?,
            loader_batch_size,
            onnx_config: OnnxConfig::default(),
            inference: InferenceOptions::default(),
            ensemble: EnsembleOptions::default(),
        })
    }

    /// 用参数文件覆盖默认推理参数
    pub fn with_options_file(mut self, options: OptionsFile) -> Self {
        if let Some(inference) = options.inference {
            self.inference = inference;
        }
        if let Some(ensemble) = options.ensemble {
            self.ensemble = ensemble;
        }
        self
    }

    pub fn is_ensemble(&self) -> bool {
        self.model_paths.len() > 1
    }
}

/// 推理设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda { device_id: u32 },
}

impl FromStr for Device {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim().to_ascii_lowercase();
        match value.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda { device_id: 0 }),
            other => match other.strip_prefix("cuda:") {
                Some(id) => id
                    .parse::<u32>()
                    .map(|device_id| Device::Cuda { device_id })
                    .map_err(|_| SegError::Config(format!("Invalid CUDA device id: {}", id))),
                None => Err(SegError::Config(format!(
                    "Unknown device '{}', expected 'cpu', 'cuda' or 'cuda:N'",
                    s
                ))),
            },
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{}", device_id),
        }
    }
}
