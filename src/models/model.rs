use crate::config::Device;
use crate::Result;
use ndarray::{Array5, ArrayView5};

/// 分割/复原网络的统一能力接口
///
/// 具体网络结构只是这一接口的不同实现，驱动层不关心其内部。
pub trait SegmentationModel: Send {
    /// 模型名称，用于日志
    fn name(&self) -> &str;

    /// 前向推理：输入与输出均为 (B, C, D, H, W)
    fn forward(&self, input: ArrayView5<'_, f32>) -> Result<Array5<f32>>;

    /// 将模型迁移到指定设备
    fn to_device(&mut self, device: Device) -> Result<()>;

    /// 切换到推理模式
    fn eval(&mut self);

    /// 当前所在设备
    fn device(&self) -> Device;
}

impl<M: SegmentationModel + ?Sized> SegmentationModel for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn forward(&self, input: ArrayView5<'_, f32>) -> Result<Array5<f32>> {
        (**self).forward(input)
    }

    fn to_device(&mut self, device: Device) -> Result<()> {
        (**self).to_device(device)
    }

    fn eval(&mut self) {
        (**self).eval()
    }

    fn device(&self) -> Device {
        (**self).device()
    }
}
