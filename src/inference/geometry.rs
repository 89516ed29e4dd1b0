//! 张量几何规范化
//!
//! 调用方可能给出二维或三维、带或不带batch维的张量。这里统一成
//! (B, C, D, H, W) 五维布局，缺失的batch或深度维以单例轴补齐。

use crate::utils::error::SegError;
use crate::Result;
use ndarray::{Array5, ArrayD, Axis, Ix5};

/// 除去batch与通道维之后的空间维数
pub fn num_spatial_dims(rank: usize, with_batch_dim: bool) -> usize {
    let non_spatial = if with_batch_dim { 2 } else { 1 };
    rank.saturating_sub(non_spatial)
}

/// 将单个张量规范化为 (B, C, D, H, W)，返回规范化结果与空间维数
pub fn normalize(tensor: ArrayD<f32>, with_batch_dim: bool) -> Result<(Array5<f32>, usize)> {
    let rank = tensor.ndim();
    if !(3..=5).contains(&rank) {
        return Err(SegError::Geometry(format!(
            "expected a tensor with 3, 4 or 5 axes, got shape {:?}",
            tensor.shape()
        )));
    }

    let spatial_dims = num_spatial_dims(rank, with_batch_dim);
    let canonical = match (spatial_dims, with_batch_dim) {
        // [B, C, H, W] -> [B, C, 1, H, W]
        (2, true) => tensor.insert_axis(Axis(2)),
        // 已经是 [B, C, D, H, W]
        (3, true) => tensor,
        // [C, H, W] -> [1, C, 1, H, W]
        (2, false) => tensor.insert_axis(Axis(1)).insert_axis(Axis(0)),
        // [C, D, H, W] -> [1, C, D, H, W]
        (3, false) => tensor.insert_axis(Axis(0)),
        _ => {
            return Err(SegError::Geometry(format!(
                "{} spatial dimensions for shape {:?} (batch axis: {})",
                spatial_dims,
                tensor.shape(),
                with_batch_dim
            )))
        }
    };

    Ok((canonical.into_dimensionality::<Ix5>()?, spatial_dims))
}

/// 同时规范化输出与目标张量，两者的轴数必须一致
pub fn normalize_pair(
    output: ArrayD<f32>,
    target: ArrayD<f32>,
    with_batch_dim: bool,
) -> Result<(Array5<f32>, Array5<f32>)> {
    if output.ndim() != target.ndim() {
        return Err(SegError::Geometry(format!(
            "output {:?} and target {:?} have different ranks",
            output.shape(),
            target.shape()
        )));
    }
    let (output, _) = normalize(output, with_batch_dim)?;
    let (target, _) = normalize(target, with_batch_dim)?;
    Ok((output, target))
}

/// `normalize` 的逆操作：去掉补齐的单例轴，恢复调用方的布局
pub fn restore(tensor: Array5<f32>, spatial_dims: usize, with_batch_dim: bool) -> Result<ArrayD<f32>> {
    let mut restored = tensor.into_dyn();
    if spatial_dims == 2 {
        if restored.len_of(Axis(2)) != 1 {
            return Err(SegError::Geometry(format!(
                "cannot drop depth axis of extent {} from a 2D result",
                restored.len_of(Axis(2))
            )));
        }
        restored = restored.index_axis_move(Axis(2), 0);
    }
    if !with_batch_dim {
        if restored.len_of(Axis(0)) != 1 {
            return Err(SegError::Geometry(format!(
                "cannot drop batch axis of extent {}",
                restored.len_of(Axis(0))
            )));
        }
        restored = restored.index_axis_move(Axis(0), 0);
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn zeros(shape: &[usize]) -> ArrayD<f32> {
        ArrayD::zeros(IxDyn(shape))
    }

    #[test]
    fn supported_shapes_become_five_axes() {
        let cases: [(&[usize], bool, [usize; 5], usize); 4] = [
            (&[2, 3, 8, 9], true, [2, 3, 1, 8, 9], 2),
            (&[2, 3, 4, 8, 9], true, [2, 3, 4, 8, 9], 3),
            (&[3, 8, 9], false, [1, 3, 1, 8, 9], 2),
            (&[3, 4, 8, 9], false, [1, 3, 4, 8, 9], 3),
        ];
        for (shape, batch, expected, dims) in cases {
            let (out, spatial) = normalize(zeros(shape), batch).unwrap();
            assert_eq!(out.shape(), &expected, "shape {:?} batch {}", shape, batch);
            assert_eq!(spatial, dims);
        }
    }

    #[test]
    fn invalid_combinations_fail() {
        let cases: [(&[usize], bool); 4] = [
            (&[3, 8, 9], true),
            (&[1, 3, 4, 8, 9], false),
            (&[8, 9], false),
            (&[1, 1, 1, 1, 8, 9], true),
        ];
        for (shape, batch) in cases {
            let err = normalize(zeros(shape), batch).unwrap_err();
            assert!(matches!(err, SegError::Geometry(_)), "shape {:?}", shape);
        }
    }

    #[test]
    fn pair_requires_matching_rank() {
        let err = normalize_pair(zeros(&[1, 2, 4, 4]), zeros(&[2, 4, 4]), true).unwrap_err();
        assert!(matches!(err, SegError::Geometry(_)));

        let (o, t) = normalize_pair(zeros(&[2, 4, 4]), zeros(&[2, 4, 4]), false).unwrap();
        assert_eq!(o.shape(), &[1, 2, 1, 4, 4]);
        assert_eq!(t.shape(), &[1, 2, 1, 4, 4]);
    }

    #[test]
    fn restore_round_trips_layout() {
        for (shape, batch) in [(&[2usize, 3, 8, 9][..], true), (&[3, 4, 8, 9][..], false)] {
            let (canonical, dims) = normalize(zeros(shape), batch).unwrap();
            let back = restore(canonical, dims, batch).unwrap();
            assert_eq!(back.shape(), shape);
        }
    }
}
