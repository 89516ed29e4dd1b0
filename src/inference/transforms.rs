use crate::utils::error::SegError;
use crate::Result;
use ndarray::{ArrayD, Axis, Zip};

/// 全图推理结果的后处理变换，输入输出均为带batch的张量（通道轴为1）
pub trait PostTransform: Send + Sync {
    fn apply(&self, tensor: ArrayD<f32>) -> Result<ArrayD<f32>>;
}

impl<F> PostTransform for F
where
    F: Fn(ArrayD<f32>) -> Result<ArrayD<f32>> + Send + Sync,
{
    fn apply(&self, tensor: ArrayD<f32>) -> Result<ArrayD<f32>> {
        self(tensor)
    }
}

/// 按顺序组合多个变换
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn PostTransform>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then<T: PostTransform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl PostTransform for Compose {
    fn apply(&self, tensor: ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.transforms
            .iter()
            .try_fold(tensor, |acc, transform| transform.apply(acc))
    }
}

pub struct Identity;

impl PostTransform for Identity {
    fn apply(&self, tensor: ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(tensor)
    }
}

/// 通道维上的softmax
pub struct Softmax;

impl PostTransform for Softmax {
    fn apply(&self, mut tensor: ArrayD<f32>) -> Result<ArrayD<f32>> {
        check_channel_axis(&tensor)?;
        for mut lane in tensor.lanes_mut(Axis(1)) {
            let max = lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            lane.mapv_inplace(|v| (v - max).exp());
            let sum = lane.sum();
            if sum > 0.0 {
                lane.mapv_inplace(|v| v / sum);
            }
        }
        Ok(tensor)
    }
}

pub struct Sigmoid;

impl PostTransform for Sigmoid {
    fn apply(&self, mut tensor: ArrayD<f32>) -> Result<ArrayD<f32>> {
        tensor.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp()));
        Ok(tensor)
    }
}

/// 通道维argmax，保留单例通道轴
pub struct Argmax;

impl PostTransform for Argmax {
    fn apply(&self, tensor: ArrayD<f32>) -> Result<ArrayD<f32>> {
        check_channel_axis(&tensor)?;
        let mut labels = tensor.index_axis(Axis(1), 0).mapv(|_| 0.0f32);
        Zip::from(&mut labels)
            .and(tensor.lanes(Axis(1)))
            .for_each(|label, lane| {
                let mut best = f32::NEG_INFINITY;
                for (c, &v) in lane.iter().enumerate() {
                    // 并列时保留较小的类别号
                    if v > best {
                        best = v;
                        *label = c as f32;
                    }
                }
            });
        Ok(labels.insert_axis(Axis(1)))
    }
}

/// 大于阈值置1，否则置0
pub struct Threshold(pub f32);

impl PostTransform for Threshold {
    fn apply(&self, mut tensor: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let threshold = self.0;
        tensor.mapv_inplace(|v| if v > threshold { 1.0 } else { 0.0 });
        Ok(tensor)
    }
}

fn check_channel_axis(tensor: &ArrayD<f32>) -> Result<()> {
    if tensor.ndim() < 2 {
        return Err(SegError::Geometry(format!(
            "expected a batched tensor with a channel axis, got shape {:?}",
            tensor.shape()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, IxDyn};

    fn logits() -> ArrayD<f32> {
        // (B=1, C=3, H=1, W=2)
        let mut t = Array4::<f32>::zeros((1, 3, 1, 2));
        t[[0, 0, 0, 0]] = 0.1;
        t[[0, 1, 0, 0]] = 2.0;
        t[[0, 2, 0, 0]] = -1.0;
        t[[0, 0, 0, 1]] = 5.0;
        t[[0, 1, 0, 1]] = 5.0;
        t[[0, 2, 0, 1]] = 1.0;
        t.into_dyn()
    }

    #[test]
    fn argmax_keeps_a_singleton_channel() {
        let labels = Argmax.apply(logits()).unwrap();
        assert_eq!(labels.shape(), &[1, 1, 1, 2]);
        assert_eq!(labels[IxDyn(&[0, 0, 0, 0])], 1.0);
        assert_eq!(labels[IxDyn(&[0, 0, 0, 1])], 0.0);
    }

    #[test]
    fn softmax_sums_to_one_per_pixel() {
        let probs = Softmax.apply(logits()).unwrap();
        for lane in probs.lanes(Axis(1)) {
            assert!((lane.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn compose_applies_in_order() {
        let pipeline = Compose::new().then(Softmax).then(Argmax).then(
            |t: ArrayD<f32>| -> Result<ArrayD<f32>> { Ok(t.mapv(|v| v + 10.0)) },
        );
        assert_eq!(pipeline.len(), 3);
        let out = pipeline.apply(logits()).unwrap();
        assert_eq!(out[IxDyn(&[0, 0, 0, 0])], 11.0);
    }

    #[test]
    fn threshold_and_sigmoid() {
        let t = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2]), vec![-3.0f32, 3.0]).unwrap();
        let out = Compose::new().then(Sigmoid).then(Threshold(0.5)).apply(t).unwrap();
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0]);
        assert!(Compose::new().is_empty());
    }
}
