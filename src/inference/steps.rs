//! 评估与预测步骤
//!
//! 步骤函数不持有状态：损失、指标变换和类别名通过 `StepContext` 显式传入，
//! 结果以 `StepOutcome` 返回，由调用方决定如何记录。

use crate::inference::geometry;
use crate::inference::transforms::PostTransform;
use crate::losses::Loss;
use crate::models::SegmentationModel;
use crate::utils::error::SegError;
use crate::Result;
use ndarray::{Array2, ArrayD, Axis};

/// 逐样本、逐类别的 Dice 系数
#[derive(Debug, Clone, Copy)]
pub struct DiceMetric {
    /// 是否计算第0类（背景）
    pub include_background: bool,
}

impl Default for DiceMetric {
    fn default() -> Self {
        Self {
            include_background: true,
        }
    }
}

impl DiceMetric {
    pub fn new(include_background: bool) -> Self {
        Self { include_background }
    }

    /// 输入为 (B, C, ...) 的二值（或概率）张量，返回 (B, C') 的分数；
    /// 目标为空的类别得到 NaN，不参与批次平均
    pub fn compute(&self, y_pred: &ArrayD<f32>, y: &ArrayD<f32>) -> Result<Array2<f32>> {
        if y_pred.shape() != y.shape() {
            return Err(SegError::Geometry(format!(
                "prediction {:?} and target {:?} must have the same shape",
                y_pred.shape(),
                y.shape()
            )));
        }
        if y_pred.ndim() < 3 {
            return Err(SegError::Geometry(format!(
                "expected (B, C, ...) tensors, got shape {:?}",
                y_pred.shape()
            )));
        }

        let (batch, channels) = (y_pred.len_of(Axis(0)), y_pred.len_of(Axis(1)));
        let first = if self.include_background { 0 } else { 1 };
        let classes = channels.saturating_sub(first);

        let mut scores = Array2::<f32>::from_elem((batch, classes), f32::NAN);
        for b in 0..batch {
            let pred = y_pred.index_axis(Axis(0), b);
            let target = y.index_axis(Axis(0), b);
            for c in 0..classes {
                let (mut intersection, mut pred_sum, mut target_sum) = (0.0f32, 0.0f32, 0.0f32);
                let p = pred.index_axis(Axis(0), first + c);
                let t = target.index_axis(Axis(0), first + c);
                for (&p, &t) in p.iter().zip(t.iter()) {
                    let (p, t) = (binarize(p), binarize(t));
                    intersection += p * t;
                    pred_sum += p;
                    target_sum += t;
                }
                if target_sum > 0.0 {
                    scores[[b, c]] = 2.0 * intersection / (pred_sum + target_sum);
                }
            }
        }
        Ok(scores)
    }
}

fn binarize(v: f32) -> f32 {
    if v > 0.5 {
        1.0
    } else {
        0.0
    }
}

/// 步骤函数的显式上下文
pub struct StepContext<'a> {
    pub criterion: &'a dyn Loss,
    pub metric: Option<DiceMetric>,
    /// 计算指标前对网络输出的变换（如 softmax + argmax + one-hot）
    pub metric_transform: Option<&'a dyn PostTransform>,
    pub class_names: &'a [String],
}

/// 一次评估步骤的结果
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub loss: f32,
    /// (类别名, 该批次的平均分数)
    pub per_class: Vec<(String, f32)>,
}

/// 计算损失和逐类别指标
pub fn evaluate_step(ctx: &StepContext<'_>, y_hat: &ArrayD<f32>, y: &ArrayD<f32>) -> Result<StepOutcome> {
    let loss = ctx.criterion.forward(y_hat, y)?;

    let per_class = match ctx.metric {
        Some(metric) => {
            let transformed = match ctx.metric_transform {
                Some(transform) => transform.apply(y_hat.clone())?,
                None => y_hat.clone(),
            };
            let scores = metric.compute(&transformed, y)?;
            name_scores(&nanmean_over_batch(&scores), ctx.class_names)?
        }
        None => Vec::new(),
    };

    Ok(StepOutcome { loss, per_class })
}

/// 前向推理并应用后处理变换，输入为带batch的 (B, C, [D,] H, W)
pub fn predict_step(
    model: &dyn SegmentationModel,
    post: Option<&dyn PostTransform>,
    x: ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let (inputs, spatial_dims) = geometry::normalize(x, true)?;
    let y_hat = geometry::restore(model.forward(inputs.view())?, spatial_dims, true)?;
    match post {
        Some(transform) => transform.apply(y_hat),
        None => Ok(y_hat),
    }
}

/// 按列求均值，忽略 NaN；整列为 NaN 时结果为 NaN
fn nanmean_over_batch(scores: &Array2<f32>) -> Vec<f32> {
    scores
        .columns()
        .into_iter()
        .map(|column| {
            let (sum, count) = column
                .iter()
                .filter(|v| !v.is_nan())
                .fold((0.0f32, 0usize), |(s, n), &v| (s + v, n + 1));
            if count == 0 {
                f32::NAN
            } else {
                sum / count as f32
            }
        })
        .collect()
}

/// 不计背景时分数比类别名少，从类别名尾部对齐
fn name_scores(scores: &[f32], class_names: &[String]) -> Result<Vec<(String, f32)>> {
    if class_names.len() > 1 {
        let start = class_names.len().checked_sub(scores.len()).ok_or_else(|| {
            SegError::Config(format!(
                "{} class scores but only {} class names",
                scores.len(),
                class_names.len()
            ))
        })?;
        Ok(class_names[start..]
            .iter()
            .cloned()
            .zip(scores.iter().copied())
            .collect())
    } else {
        let mean = if scores.is_empty() {
            f32::NAN
        } else {
            scores.iter().sum::<f32>() / scores.len() as f32
        };
        Ok(vec![("metrics".to_string(), mean)])
    }
}
