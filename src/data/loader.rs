use crate::data::{BatchSource, ImageDataset, ItemDataset};
use crate::utils::error::SegError;
use crate::Result;
use ndarray::{ArrayD, Axis};

/// 顺序批次加载器，从不打乱数据顺序
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: ImageDataset,
    batch_size: usize,
}

impl DataLoader {
    pub fn new(dataset: ImageDataset, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(SegError::Config("Batch size must be at least 1".to_string()));
        }
        Ok(Self { dataset, batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn load_batch(&self, start: usize) -> Result<ArrayD<f32>> {
        let end = (start + self.batch_size).min(self.dataset.len());
        let images = (start..end)
            .map(|i| self.dataset.load(i))
            .collect::<Result<Vec<_>>>()?;

        if let Some((offset, image)) = images
            .iter()
            .enumerate()
            .find(|(_, image)| image.shape() != images[0].shape())
        {
            return Err(SegError::Geometry(format!(
                "Images in one batch must share a shape: {:?} ({}) vs {:?} ({})",
                images[0].shape(),
                self.dataset.items()[start].display(),
                image.shape(),
                self.dataset.items()[start + offset].display()
            )));
        }

        let views: Vec<_> = images.iter().map(|image| image.view()).collect();
        Ok(ndarray::stack(Axis(0), &views)?)
    }
}

impl BatchSource for DataLoader {
    fn dataset(&self) -> Option<&dyn ItemDataset> {
        Some(&self.dataset)
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<ArrayD<f32>>> + '_> {
        Box::new(
            (0..self.dataset.len())
                .step_by(self.batch_size)
                .map(move |start| self.load_batch(start)),
        )
    }
}

/// 内存中的批次，没有文件身份，不能用于全图推理驱动
#[derive(Debug, Clone, Default)]
pub struct TensorBatches {
    batches: Vec<ArrayD<f32>>,
}

impl TensorBatches {
    pub fn new(batches: Vec<ArrayD<f32>>) -> Self {
        Self { batches }
    }
}

impl BatchSource for TensorBatches {
    fn dataset(&self) -> Option<&dyn ItemDataset> {
        None
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<ArrayD<f32>>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }
}
