//! 训练/评估用损失函数

use crate::inference::geometry;
use crate::utils::error::SegError;
use crate::Result;
use ndarray::{Array5, ArrayD, ArrayView4, Axis};

/// 损失函数接口，输入为网络原始输出与目标
pub trait Loss: Send + Sync {
    fn forward(&self, output: &ArrayD<f32>, target: &ArrayD<f32>) -> Result<f32>;
}

const DICE_SMOOTH: f32 = 1e-5;

/// 指数MSE与Dice+交叉熵的组合损失
///
/// 输出与目标都包含一个回归通道（如反距离变换）和一个分类通道（如分水岭种子）。
/// `loss = alpha * (1 - exp(-beta * MSE)) + (1 - alpha) * (Dice + BCE)`
#[derive(Debug, Clone)]
pub struct CombinedExpMseDiceCeLoss {
    pub alpha: f32,
    pub beta: f32,
    pub regression_channel: usize,
    pub classification_channel: usize,
    /// 分类项只有一个通道，此选项不起作用
    pub include_background: bool,
    pub with_batch_dim: bool,
}

impl Default for CombinedExpMseDiceCeLoss {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            beta: 0.1,
            regression_channel: 0,
            classification_channel: 1,
            include_background: true,
            with_batch_dim: true,
        }
    }
}

impl CombinedExpMseDiceCeLoss {
    pub fn new(alpha: f32, beta: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(SegError::Config(format!("alpha must be in [0, 1], got {}", alpha)));
        }
        Ok(Self {
            alpha,
            beta,
            ..Self::default()
        })
    }

    pub fn with_channels(mut self, regression: usize, classification: usize) -> Self {
        self.regression_channel = regression;
        self.classification_channel = classification;
        self
    }

    pub fn with_batch_dim(mut self, with_batch_dim: bool) -> Self {
        self.with_batch_dim = with_batch_dim;
        self
    }

    fn channel<'a>(&self, tensor: &'a Array5<f32>, channel: usize) -> Result<ArrayView4<'a, f32>> {
        if channel >= tensor.len_of(Axis(1)) {
            return Err(SegError::Geometry(format!(
                "channel {} out of range for shape {:?}",
                channel,
                tensor.shape()
            )));
        }
        Ok(tensor.index_axis(Axis(1), channel))
    }
}

impl Loss for CombinedExpMseDiceCeLoss {
    fn forward(&self, output: &ArrayD<f32>, target: &ArrayD<f32>) -> Result<f32> {
        if output.shape() != target.shape() {
            return Err(SegError::Geometry(format!(
                "output {:?} and target {:?} must have the same shape",
                output.shape(),
                target.shape()
            )));
        }
        let (output, target) =
            geometry::normalize_pair(output.clone(), target.clone(), self.with_batch_dim)?;

        let mse = mean_squared_error(
            self.channel(&output, self.regression_channel)?,
            self.channel(&target, self.regression_channel)?,
        );
        let mse_loss = 1.0 - (-self.beta * mse).exp();

        let logits = self.channel(&output, self.classification_channel)?;
        let labels = self.channel(&target, self.classification_channel)?;
        let dice_ce_loss = dice_loss(logits, labels) + bce_with_logits(logits, labels);

        Ok(self.alpha * mse_loss + (1.0 - self.alpha) * dice_ce_loss)
    }
}

fn mean_squared_error(output: ArrayView4<'_, f32>, target: ArrayView4<'_, f32>) -> f32 {
    let n = output.len().max(1) as f32;
    output
        .iter()
        .zip(target.iter())
        .map(|(o, t)| (o - t) * (o - t))
        .sum::<f32>()
        / n
}

/// 每个batch样本单独计算 Dice 损失后取平均
///
/// 单通道无法做softmax，logits先经过sigmoid，保证每项落在 [0, 1]
fn dice_loss(logits: ArrayView4<'_, f32>, labels: ArrayView4<'_, f32>) -> f32 {
    let batch = logits.len_of(Axis(0));
    if batch == 0 {
        return 0.0;
    }
    let total: f32 = logits
        .outer_iter()
        .zip(labels.outer_iter())
        .map(|(x, t)| {
            let (mut intersection, mut pred_sum, mut target_sum) = (0.0f32, 0.0f32, 0.0f32);
            for (&x, &t) in x.iter().zip(t.iter()) {
                let p = sigmoid(x);
                intersection += p * t;
                pred_sum += p;
                target_sum += t;
            }
            1.0 - (2.0 * intersection + DICE_SMOOTH) / (pred_sum + target_sum + DICE_SMOOTH)
        })
        .sum();
    total / batch as f32
}

/// 数值稳定的 BCEWithLogits，取均值
fn bce_with_logits(logits: ArrayView4<'_, f32>, labels: ArrayView4<'_, f32>) -> f32 {
    let n = logits.len().max(1) as f32;
    logits
        .iter()
        .zip(labels.iter())
        .map(|(&x, &t)| x.max(0.0) - x * t + (-x.abs()).exp().ln_1p())
        .sum::<f32>()
        / n
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
