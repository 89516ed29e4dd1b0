use crate::data::ItemDataset;
use crate::image::ImageLoader;
use crate::utils::error::SegError;
use crate::Result;
use ndarray::ArrayD;
use std::path::{Path, PathBuf};

/// 图像文件数据集，每项加载为 (C, H, W) 或 (C, D, H, W)
#[derive(Debug, Clone)]
pub struct ImageDataset {
    items: Vec<PathBuf>,
}

impl ImageDataset {
    /// 扫描目录中支持的图像文件，按文件名排序
    pub fn from_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(SegError::Config(format!(
                "Input folder {} does not exist",
                dir.display()
            )));
        }

        let mut items = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && ImageLoader::is_supported_format(&path) {
                items.push(path);
            }
        }
        items.sort();

        tracing::debug!("Found {} image(s) in {}", items.len(), dir.display());
        Ok(Self { items })
    }

    /// 使用给定顺序的文件列表
    pub fn from_paths(items: Vec<PathBuf>) -> Self {
        Self { items }
    }

    pub fn load(&self, index: usize) -> Result<ArrayD<f32>> {
        let path = self.items.get(index).ok_or_else(|| {
            SegError::Internal(format!(
                "Item {} requested from a dataset of {} file(s)",
                index,
                self.items.len()
            ))
        })?;
        ImageLoader::from_path(path)
    }
}

impl ItemDataset for ImageDataset {
    fn items(&self) -> &[PathBuf] {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn scans_sorted_supported_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.png", "notes.txt"] {
            let path = dir.path().join(name);
            if name.ends_with(".png") {
                GrayImage::new(4, 4).save(&path).unwrap();
            } else {
                std::fs::write(&path, "skip me").unwrap();
            }
        }
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let dataset = ImageDataset::from_dir(dir.path()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.stem(0).as_deref(), Some("a"));
        assert_eq!(dataset.stem(1).as_deref(), Some("b"));
        assert_eq!(dataset.stem(2), None);
        assert_eq!(dataset.load(0).unwrap().shape(), &[1, 4, 4]);
        assert!(dataset.load(5).is_err());
    }

    #[test]
    fn missing_folder_is_a_config_error() {
        let err = ImageDataset::from_dir(Path::new("/does/not/exist")).unwrap_err();
        assert!(matches!(err, SegError::Config(_)));
    }
}
