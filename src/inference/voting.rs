//! 集成投票
//!
//! 将N个模型对同一图像的逐像素类别预测合并为一个结果。

use crate::utils::error::SegError;
use crate::Result;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 投票机制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VotingMechanism {
    /// 逐像素众数，并列时取最小值
    #[default]
    Mode,
    /// 逐像素加权平均后四舍五入（远离零）
    Mean,
}

impl FromStr for VotingMechanism {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mode" => Ok(VotingMechanism::Mode),
            "mean" => Ok(VotingMechanism::Mean),
            other => Err(SegError::Config(format!(
                "Voting mechanism must be one of 'mode' or 'mean', got '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for VotingMechanism {
    type Error = SegError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<VotingMechanism> for String {
    fn from(value: VotingMechanism) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VotingMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VotingMechanism::Mode => write!(f, "mode"),
            VotingMechanism::Mean => write!(f, "mean"),
        }
    }
}

/// 归一化后的模型权重，和为1
#[derive(Debug, Clone, PartialEq)]
pub struct Weights(Vec<f32>);

impl Weights {
    pub fn normalized(raw: &[f32], n_models: usize) -> Result<Self> {
        if raw.len() != n_models {
            return Err(SegError::Config(format!(
                "The number of weights ({}) must match the number of models ({})",
                raw.len(),
                n_models
            )));
        }
        if raw.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(SegError::Config(format!(
                "Weights must be finite and non-negative, got {:?}",
                raw
            )));
        }
        let sum: f32 = raw.iter().sum();
        if sum <= 0.0 {
            return Err(SegError::Config("Weights must not all be zero".to_string()));
        }
        Ok(Self(raw.iter().map(|w| w / sum).collect()))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// 已校验的投票策略
#[derive(Debug, Clone, PartialEq)]
pub enum Voting {
    Mode,
    Mean(Weights),
}

impl Voting {
    /// 校验投票参数；mean 必须为每个模型提供一个权重
    pub fn resolve(
        mechanism: VotingMechanism,
        weights: Option<&[f32]>,
        n_models: usize,
    ) -> Result<Self> {
        match mechanism {
            VotingMechanism::Mode => Ok(Voting::Mode),
            VotingMechanism::Mean => {
                let raw = weights.ok_or_else(|| {
                    SegError::Config("Voting mechanism 'mean' requires weights".to_string())
                })?;
                Ok(Voting::Mean(Weights::normalized(raw, n_models)?))
            }
        }
    }

    /// 对同一图像的N个预测投票
    pub fn vote(&self, predictions: &[ArrayD<f32>]) -> Result<ArrayD<i32>> {
        let first = predictions
            .first()
            .ok_or_else(|| SegError::Config("Cannot vote over zero predictions".to_string()))?;
        if let Some(other) = predictions.iter().find(|p| p.shape() != first.shape()) {
            return Err(SegError::Geometry(format!(
                "All predictions must share a shape: {:?} vs {:?}",
                first.shape(),
                other.shape()
            )));
        }

        match self {
            Voting::Mode => Ok(vote_mode(predictions)),
            Voting::Mean(weights) => {
                if weights.as_slice().len() != predictions.len() {
                    return Err(SegError::Config(format!(
                        "Got {} predictions for {} weights",
                        predictions.len(),
                        weights.as_slice().len()
                    )));
                }
                Ok(vote_mean(predictions, weights))
            }
        }
    }
}

fn vote_mean(predictions: &[ArrayD<f32>], weights: &Weights) -> ArrayD<i32> {
    let mut ensemble = ArrayD::<f32>::zeros(predictions[0].raw_dim());
    for (&weight, prediction) in weights.as_slice().iter().zip(predictions) {
        ensemble.scaled_add(weight, prediction);
    }
    ensemble.mapv(|v| v.round() as i32)
}

fn vote_mode(predictions: &[ArrayD<f32>]) -> ArrayD<i32> {
    let mut ensemble = ArrayD::<i32>::zeros(predictions[0].raw_dim());
    let mut iters: Vec<_> = predictions.iter().map(|p| p.iter()).collect();
    let mut values = Vec::with_capacity(predictions.len());

    for out in ensemble.iter_mut() {
        values.clear();
        values.extend(iters.iter_mut().filter_map(|it| it.next().copied()));
        *out = mode_of(&mut values) as i32;
    }

    ensemble
}

/// 众数；出现次数相同时取最小值
fn mode_of(values: &mut [f32]) -> f32 {
    values.sort_by(|a, b| a.total_cmp(b));

    let mut best = values.first().copied().unwrap_or(0.0);
    let mut best_count = 0;
    let mut i = 0;
    while i < values.len() {
        let value = values[i];
        let mut j = i;
        while j < values.len() && values[j] == value {
            j += 1;
        }
        // 升序扫描，严格大于保证并列时保留较小值
        if j - i > best_count {
            best = value;
            best_count = j - i;
        }
        i = j.max(i + 1);
    }

    best
}
