use crate::image::OutputDtype;
use crate::inference::voting::VotingMechanism;
use crate::utils::error::SegError;
use crate::Result;
use serde::{Deserialize, Serialize};

/// 滑窗尺寸，(H, W) 或 (D, H, W)，必须与训练时的patch尺寸一致
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct RoiSize(Vec<usize>);

impl RoiSize {
    pub fn new(extents: &[usize]) -> Result<Self> {
        if extents.len() != 2 && extents.len() != 3 {
            return Err(SegError::Config(format!(
                "ROI size must have 2 or 3 extents, got {:?}",
                extents
            )));
        }
        if extents.iter().any(|&e| e == 0) {
            return Err(SegError::Config(format!(
                "ROI extents must be positive, got {:?}",
                extents
            )));
        }
        Ok(Self(extents.to_vec()))
    }

    pub fn extents(&self) -> &[usize] {
        &self.0
    }

    pub fn spatial_dims(&self) -> usize {
        self.0.len()
    }

    /// 统一成 (D, H, W)，二维时深度为1
    pub fn as_3d(&self) -> [usize; 3] {
        match self.0.as_slice() {
            [h, w] => [1, *h, *w],
            [d, h, w] => [*d, *h, *w],
            _ => unreachable!("RoiSize is validated on construction"),
        }
    }
}

impl TryFrom<Vec<usize>> for RoiSize {
    type Error = SegError;

    fn try_from(value: Vec<usize>) -> Result<Self> {
        RoiSize::new(&value)
    }
}

impl From<RoiSize> for Vec<usize> {
    fn from(value: RoiSize) -> Self {
        value.0
    }
}

/// 全图推理选项
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceOptions {
    /// 滑窗尺寸
    #[serde(default = "default_roi_size")]
    pub roi_size: RoiSize,

    /// 每次送入模型的滑窗数量
    #[serde(default = "default_sw_batch_size")]
    pub sw_batch_size: usize,

    /// 相邻滑窗的重叠比例 [0, 1)
    #[serde(default = "default_overlap")]
    pub overlap: f32,

    /// 保存前反转所有轴
    #[serde(default)]
    pub transpose: bool,

    /// 输出数据类型，None表示保持float32
    #[serde(default)]
    pub output_dtype: Option<OutputDtype>,

    /// 输出文件名前缀
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_roi_size() -> RoiSize {
    RoiSize(vec![128, 128])
}

fn default_sw_batch_size() -> usize {
    4
}

fn default_overlap() -> f32 {
    0.25
}

fn default_prefix() -> String {
    "pred_".to_string()
}

fn default_ensemble_prefix() -> String {
    "ensemble_".to_string()
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            roi_size: default_roi_size(),
            sw_batch_size: default_sw_batch_size(),
            overlap: default_overlap(),
            transpose: false,
            output_dtype: None,
            prefix: default_prefix(),
        }
    }
}

/// 集成推理选项
#[derive(Debug, Clone, Deserialize)]
pub struct EnsembleOptions {
    /// 投票机制
    #[serde(default)]
    pub voting_mechanism: VotingMechanism,

    /// 各模型权重，仅在 mean 投票时使用
    #[serde(default)]
    pub weights: Option<Vec<f32>>,

    /// 是否同时保存每个模型的单独预测
    #[serde(default)]
    pub save_individual_preds: bool,

    /// 集成结果文件名前缀
    #[serde(default = "default_ensemble_prefix")]
    pub ensemble_prefix: String,
}

impl Default for EnsembleOptions {
    fn default() -> Self {
        Self {
            voting_mechanism: VotingMechanism::default(),
            weights: None,
            save_individual_preds: false,
            ensemble_prefix: default_ensemble_prefix(),
        }
    }
}

/// 推理处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InferenceStage {
    Preparing,
    Inference,
    Voting,
    Writing,
    Completed,
}

/// 推理处理状态
#[derive(Debug, Clone)]
pub struct InferenceStatus {
    /// 当前处理阶段
    pub stage: InferenceStage,
    /// 进度百分比 (0.0 - 1.0)
    pub progress: f32,
    /// 状态消息
    pub message: String,
    /// 已处理的图像数量
    pub processed_images: usize,
    /// 总图像数量
    pub total_images: usize,
}

impl InferenceStatus {
    pub fn new(stage: InferenceStage, progress: f32, message: &str) -> Self {
        Self {
            stage,
            progress,
            message: message.to_string(),
            processed_images: 0,
            total_images: 0,
        }
    }

    pub fn with_images(mut self, processed: usize, total: usize) -> Self {
        self.processed_images = processed;
        self.total_images = total;
        self
    }
}
