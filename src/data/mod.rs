//! 推理数据来源
//!
//! 驱动层按批次顺序消费数据，并依靠一个递增计数器把第k个输出对应到
//! 数据集中的第k个文件。因此数据来源必须可按文件寻址，且不能打乱顺序。

pub mod dataset;
pub mod loader;

pub use dataset::ImageDataset;
pub use loader::{DataLoader, TensorBatches};

use crate::Result;
use ndarray::ArrayD;
use std::path::PathBuf;

/// 按文件寻址的数据集
pub trait ItemDataset {
    /// 有序的文件列表
    fn items(&self) -> &[PathBuf];

    /// 第i个文件的文件名（不含扩展名）
    fn stem(&self, index: usize) -> Option<String> {
        self.items()
            .get(index)
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
    }

    fn len(&self) -> usize {
        self.items().len()
    }

    fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

/// 批次来源，每个批次为 (B, C, [D,] H, W)
pub trait BatchSource {
    /// 底层数据集；不能按文件寻址时返回None
    fn dataset(&self) -> Option<&dyn ItemDataset>;

    /// 按固定顺序产生批次
    fn batches(&self) -> Box<dyn Iterator<Item = Result<ArrayD<f32>>> + '_>;
}
