//! 滑窗推理
//!
//! 把任意大小的图像切成相互重叠的ROI窗口，分批送入模型，再用高斯权重
//! 把窗口输出拼回全图。窗口中心权重最高、边缘平滑衰减，避免拼接缝。

use crate::inference::types::{InferenceOptions, RoiSize};
use crate::models::SegmentationModel;
use crate::utils::error::SegError;
use crate::Result;
use ndarray::{s, Array3, Array4, Array5, ArrayView5, Axis, CowArray, Ix5};

/// 高斯权重的sigma相对ROI尺寸的比例
pub const DEFAULT_SIGMA_SCALE: f32 = 0.125;

#[derive(Debug, Clone)]
pub struct SlidingWindowInferer {
    roi_size: RoiSize,
    sw_batch_size: usize,
    overlap: f32,
    sigma_scale: f32,
}

/// 单个窗口在padding后图像中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    batch: usize,
    start: [usize; 3],
}

impl SlidingWindowInferer {
    pub fn new(roi_size: RoiSize, sw_batch_size: usize, overlap: f32) -> Result<Self> {
        if sw_batch_size == 0 {
            return Err(SegError::Config(
                "Sliding window batch size must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&overlap) {
            return Err(SegError::Config(format!(
                "Overlap must be in [0, 1), got {}",
                overlap
            )));
        }

        Ok(Self {
            roi_size,
            sw_batch_size,
            overlap,
            sigma_scale: DEFAULT_SIGMA_SCALE,
        })
    }

    pub fn from_options(options: &InferenceOptions) -> Result<Self> {
        Self::new(options.roi_size.clone(), options.sw_batch_size, options.overlap)
    }

    pub fn with_sigma_scale(mut self, sigma_scale: f32) -> Self {
        self.sigma_scale = sigma_scale;
        self
    }

    pub fn roi_size(&self) -> &RoiSize {
        &self.roi_size
    }

    /// 对 (B, C, D, H, W) 输入做滑窗推理，输出空间尺寸与输入一致
    pub fn infer(
        &self,
        inputs: ArrayView5<'_, f32>,
        model: &dyn SegmentationModel,
    ) -> Result<Array5<f32>> {
        let (batch, channels, depth, height, width) = inputs.dim();
        let image_size = [depth, height, width];

        if self.roi_size.spatial_dims() == 2 && depth != 1 {
            return Err(SegError::Geometry(format!(
                "2D ROI {:?} cannot be applied to a volume of depth {}",
                self.roi_size.extents(),
                depth
            )));
        }
        if image_size.iter().any(|&e| e == 0) || batch == 0 {
            return Err(SegError::Geometry(format!(
                "Cannot run sliding window inference on an empty tensor {:?}",
                inputs.shape()
            )));
        }

        let roi = self.roi_size.as_3d();

        // 比ROI小的轴两侧补零到ROI大小，结束时再裁回
        let mut pad_before = [0usize; 3];
        let mut padded_size = image_size;
        for k in 0..3 {
            if image_size[k] < roi[k] {
                pad_before[k] = (roi[k] - image_size[k]) / 2;
                padded_size[k] = roi[k];
            }
        }
        let needs_padding = padded_size != image_size;
        let padded: CowArray<'_, f32, Ix5> = if needs_padding {
            let mut buffer = Array5::<f32>::zeros((
                batch,
                channels,
                padded_size[0],
                padded_size[1],
                padded_size[2],
            ));
            buffer
                .slice_mut(s![
                    ..,
                    ..,
                    pad_before[0]..pad_before[0] + depth,
                    pad_before[1]..pad_before[1] + height,
                    pad_before[2]..pad_before[2] + width
                ])
                .assign(&inputs);
            CowArray::from(buffer)
        } else {
            CowArray::from(inputs)
        };

        let starts: Vec<Vec<usize>> = (0..3)
            .map(|k| {
                let interval = scan_interval(padded_size[k], roi[k], self.overlap);
                window_starts(padded_size[k], roi[k], interval)
            })
            .collect();

        let mut windows = Vec::new();
        for b in 0..batch {
            for &d in &starts[0] {
                for &h in &starts[1] {
                    for &w in &starts[2] {
                        windows.push(Window { batch: b, start: [d, h, w] });
                    }
                }
            }
        }

        tracing::debug!(
            roi = ?roi,
            overlap = self.overlap,
            windows = windows.len(),
            sw_batch_size = self.sw_batch_size,
            "Starting sliding window inference"
        );

        let importance = gaussian_importance_map(roi, self.sigma_scale);
        let importance_c = importance.view().insert_axis(Axis(0));

        let mut accumulated: Option<Array5<f32>> = None;
        let mut weight_sum =
            Array4::<f32>::zeros((batch, padded_size[0], padded_size[1], padded_size[2]));

        for chunk in windows.chunks(self.sw_batch_size) {
            let mut window_batch =
                Array5::<f32>::zeros((chunk.len(), channels, roi[0], roi[1], roi[2]));
            for (i, window) in chunk.iter().enumerate() {
                let [d, h, w] = window.start;
                window_batch.index_axis_mut(Axis(0), i).assign(&padded.slice(s![
                    window.batch,
                    ..,
                    d..d + roi[0],
                    h..h + roi[1],
                    w..w + roi[2]
                ]));
            }

            let prediction = model.forward(window_batch.view())?;
            let (n, out_channels, od, oh, ow) = prediction.dim();
            if n != chunk.len() || [od, oh, ow] != roi {
                return Err(SegError::Inference(format!(
                    "Model '{}' returned shape {:?} for {} window(s) of size {:?}",
                    model.name(),
                    prediction.shape(),
                    chunk.len(),
                    roi
                )));
            }

            let output = accumulated.get_or_insert_with(|| {
                Array5::<f32>::zeros((
                    batch,
                    out_channels,
                    padded_size[0],
                    padded_size[1],
                    padded_size[2],
                ))
            });
            if output.len_of(Axis(1)) != out_channels {
                return Err(SegError::Inference(format!(
                    "Model '{}' changed its output channels from {} to {}",
                    model.name(),
                    output.len_of(Axis(1)),
                    out_channels
                )));
            }

            for (i, window) in chunk.iter().enumerate() {
                let [d, h, w] = window.start;
                let weighted = &prediction.index_axis(Axis(0), i) * &importance_c;

                let mut region = output.slice_mut(s![
                    window.batch,
                    ..,
                    d..d + roi[0],
                    h..h + roi[1],
                    w..w + roi[2]
                ]);
                region += &weighted;

                let mut weights = weight_sum.slice_mut(s![
                    window.batch,
                    d..d + roi[0],
                    h..h + roi[1],
                    w..w + roi[2]
                ]);
                weights += &importance;
            }
        }

        let mut output = accumulated
            .ok_or_else(|| SegError::Internal("Sliding window produced no windows".to_string()))?;
        output /= &weight_sum.insert_axis(Axis(1));

        if needs_padding {
            output = output
                .slice(s![
                    ..,
                    ..,
                    pad_before[0]..pad_before[0] + depth,
                    pad_before[1]..pad_before[1] + height,
                    pad_before[2]..pad_before[2] + width
                ])
                .to_owned();
        }

        Ok(output)
    }
}

/// 相邻窗口起点间距；ROI覆盖整轴时只需一个窗口
fn scan_interval(image_extent: usize, roi_extent: usize, overlap: f32) -> usize {
    if roi_extent == image_extent {
        return roi_extent;
    }
    ((roi_extent as f32 * (1.0 - overlap)) as usize).max(1)
}

/// 沿一个轴的窗口起点，最后一个窗口贴齐图像边缘
fn window_starts(image_extent: usize, roi_extent: usize, interval: usize) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut start = 0;
    loop {
        if start + roi_extent >= image_extent {
            starts.push(image_extent - roi_extent);
            return starts;
        }
        starts.push(start);
        start += interval;
    }
}

/// 可分离高斯权重图，归一化到最大值1，零值用最小非零值替代
fn gaussian_importance_map(roi: [usize; 3], sigma_scale: f32) -> Array3<f32> {
    let profiles: Vec<Vec<f32>> = roi
        .iter()
        .map(|&extent| {
            let sigma = (extent as f32 * sigma_scale).max(f32::EPSILON);
            let center = (extent / 2) as f32;
            (0..extent)
                .map(|i| {
                    let x = i as f32 - center;
                    (-(x * x) / (2.0 * sigma * sigma)).exp()
                })
                .collect()
        })
        .collect();

    let mut map = Array3::from_shape_fn((roi[0], roi[1], roi[2]), |(d, h, w)| {
        profiles[0][d] * profiles[1][h] * profiles[2][w]
    });

    let max = map.fold(0.0f32, |acc, &v| acc.max(v));
    if max > 0.0 {
        map.mapv_inplace(|v| v / max);
    }

    let min_non_zero = map
        .iter()
        .copied()
        .filter(|&v| v > 0.0)
        .fold(f32::INFINITY, f32::min);
    if min_non_zero.is_finite() {
        map.mapv_inplace(|v| if v > 0.0 { v } else { min_non_zero });
    }

    map
}
