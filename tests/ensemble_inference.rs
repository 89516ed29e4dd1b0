use ndarray::{Array2, Array5, ArrayD, ArrayView5};
use onnx_seg::{
    data::{BatchSource, DataLoader, ImageDataset, ItemDataset, TensorBatches},
    image::{ImageLoader, OutputDtype, OutputImage, TiffWriter},
    inference::{
        EnsembleOptions, Identity, InferenceOptions, InferencePipeline, InferenceStage,
        PostTransform, RoiSize, VotingMechanism,
    },
    models::SegmentationModel,
    Device, Result, SegError,
};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tiff::decoder::{Decoder, DecodingResult};
use tokio::sync::mpsc;

/// 输出单通道常数预测的模型，记录被调用的次数
struct ConstantModel {
    value: f32,
    touched: Arc<AtomicUsize>,
}

impl ConstantModel {
    fn boxed(value: f32, touched: &Arc<AtomicUsize>) -> Box<dyn SegmentationModel> {
        Box::new(Self {
            value,
            touched: Arc::clone(touched),
        })
    }
}

impl SegmentationModel for ConstantModel {
    fn name(&self) -> &str {
        "constant"
    }

    fn forward(&self, input: ArrayView5<'_, f32>) -> Result<Array5<f32>> {
        self.touched.fetch_add(1, Ordering::SeqCst);
        let (b, _, d, h, w) = input.dim();
        Ok(Array5::from_elem((b, 1, d, h, w), self.value))
    }

    fn to_device(&mut self, _device: Device) -> Result<()> {
        self.touched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn eval(&mut self) {
        self.touched.fetch_add(1, Ordering::SeqCst);
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

/// 输出 = 输入 * 0.5
struct HalfModel;

impl SegmentationModel for HalfModel {
    fn name(&self) -> &str {
        "half"
    }

    fn forward(&self, input: ArrayView5<'_, f32>) -> Result<Array5<f32>> {
        Ok(input.mapv(|v| v * 0.5))
    }

    fn to_device(&mut self, _device: Device) -> Result<()> {
        Ok(())
    }

    fn eval(&mut self) {}

    fn device(&self) -> Device {
        Device::Cpu
    }
}

fn rounding() -> impl PostTransform {
    |t: ArrayD<f32>| -> Result<ArrayD<f32>> { Ok(t.mapv(f32::round)) }
}

/// 在输入目录写一张 (height, width) 的灰度TIFF
fn write_input(dir: &Path, stem: &str, height: usize, width: usize) {
    let plane = Array2::from_shape_fn((height, width), |(y, x)| (y * width + x) as u8).into_dyn();
    TiffWriter::write(&dir.join(format!("{}.tif", stem)), &OutputImage::U8(plane)).unwrap();
}

fn loader_for(dir: &Path) -> DataLoader {
    DataLoader::new(ImageDataset::from_dir(dir).unwrap(), 1).unwrap()
}

fn options(roi: &[usize]) -> InferenceOptions {
    InferenceOptions {
        roi_size: RoiSize::new(roi).unwrap(),
        ..InferenceOptions::default()
    }
}

fn tiff_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn mode_ensemble_writes_ensemble_and_fold_predictions() {
    let input = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    write_input(input.path(), "cells", 8, 8);

    let touched = Arc::new(AtomicUsize::new(0));
    let mut models = vec![ConstantModel::boxed(1.0, &touched), ConstantModel::boxed(2.0, &touched)];
    let ensemble = EnsembleOptions {
        voting_mechanism: VotingMechanism::Mode,
        save_individual_preds: true,
        ..EnsembleOptions::default()
    };

    let done = InferencePipeline::full_inference_ensemble(
        &mut models,
        &loader_for(input.path()),
        target.path(),
        &rounding(),
        &options(&[8, 8]),
        &ensemble,
        Device::Cpu,
        None,
    )
    .unwrap();
    assert!(done);

    assert_eq!(tiff_files(target.path()), vec!["ensemble_cells.tif".to_string()]);
    assert_eq!(tiff_files(&target.path().join("fold_0")), vec!["pred_cells.tif".to_string()]);
    assert_eq!(tiff_files(&target.path().join("fold_1")), vec!["pred_cells.tif".to_string()]);

    // 两个模型并列，取较小的类别；未指定类型时集成结果保存为int32
    let mut decoder =
        Decoder::new(BufReader::new(File::open(target.path().join("ensemble_cells.tif")).unwrap()))
            .unwrap();
    assert_eq!(decoder.dimensions().unwrap(), (8, 8));
    match decoder.read_image().unwrap() {
        DecodingResult::I32(values) => assert!(values.iter().all(|&v| v == 1)),
        _ => panic!("ensemble prediction should be int32"),
    }

    let fold_1 = ImageLoader::from_path(&target.path().join("fold_1/pred_cells.tif")).unwrap();
    assert!(fold_1.iter().all(|&v| v == 2.0));
}

#[test]
fn mean_ensemble_casts_and_transposes() {
    let input = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    write_input(input.path(), "a", 6, 10);
    write_input(input.path(), "b", 6, 10);

    let touched = Arc::new(AtomicUsize::new(0));
    let mut models = vec![ConstantModel::boxed(2.0, &touched), ConstantModel::boxed(3.0, &touched)];
    let ensemble = EnsembleOptions {
        voting_mechanism: VotingMechanism::Mean,
        weights: Some(vec![1.0, 1.0]),
        ..EnsembleOptions::default()
    };
    let options = InferenceOptions {
        transpose: true,
        output_dtype: Some(OutputDtype::U8),
        overlap: 0.5,
        ..options(&[4, 4])
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    InferencePipeline::full_inference_ensemble(
        &mut models,
        &loader_for(input.path()),
        target.path(),
        &rounding(),
        &options,
        &ensemble,
        Device::Cpu,
        Some(&tx),
    )
    .unwrap();
    drop(tx);

    assert_eq!(
        tiff_files(target.path()),
        vec!["ensemble_a.tif".to_string(), "ensemble_b.tif".to_string()]
    );
    assert!(!target.path().join("fold_0").exists());

    // round(0.5 * 2 + 0.5 * 3) = 3
    let ensemble_a = ImageLoader::from_path(&target.path().join("ensemble_a.tif")).unwrap();
    assert_eq!(ensemble_a.shape(), &[1, 10, 6]);
    assert!(ensemble_a.iter().all(|&v| v == 3.0));

    let mut last = None;
    while let Ok(status) = rx.try_recv() {
        last = Some(status);
    }
    let last = last.unwrap();
    assert_eq!(last.stage, InferenceStage::Completed);
    assert_eq!((last.processed_images, last.total_images), (2, 2));
}

#[test]
fn weight_mismatch_fails_before_touching_models() {
    let input = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let target = root.path().join("out");
    write_input(input.path(), "cells", 8, 8);

    let touched = Arc::new(AtomicUsize::new(0));
    let mut models = vec![ConstantModel::boxed(1.0, &touched), ConstantModel::boxed(2.0, &touched)];
    let ensemble = EnsembleOptions {
        voting_mechanism: VotingMechanism::Mean,
        weights: Some(vec![1.0, 1.0, 1.0]),
        ..EnsembleOptions::default()
    };

    let err = InferencePipeline::full_inference_ensemble(
        &mut models,
        &loader_for(input.path()),
        &target,
        &Identity,
        &options(&[8, 8]),
        &ensemble,
        Device::Cpu,
        None,
    )
    .unwrap_err();

    assert!(matches!(err, SegError::Config(_)));
    assert!(err.is_fail_fast());
    assert_eq!(touched.load(Ordering::SeqCst), 0);
    assert!(!target.exists());
}

#[test]
fn single_model_reruns_are_identical() {
    let input = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    write_input(input.path(), "cells", 12, 9);
    let loader = loader_for(input.path());
    let options = InferenceOptions {
        prefix: "run_".to_string(),
        ..options(&[8, 8])
    };

    let run = || {
        InferencePipeline::full_inference(
            &mut HalfModel,
            &loader,
            target.path(),
            &Identity,
            &options,
            Device::Cpu,
            None,
        )
        .unwrap()
    };

    assert!(run());
    let first = std::fs::read(target.path().join("run_cells.tif")).unwrap();
    assert!(run());
    let second = std::fs::read(target.path().join("run_cells.tif")).unwrap();
    assert_eq!(first, second);
    assert_eq!(tiff_files(target.path()), vec!["run_cells.tif".to_string()]);

    let pred = ImageLoader::from_path(&target.path().join("run_cells.tif")).unwrap();
    assert_eq!(pred.shape(), &[1, 12, 9]);
    assert!((pred[[0, 11, 8]] - 107.0 * 0.5).abs() < 1e-3);
}

#[test]
fn sources_without_file_names_are_rejected() {
    let target = tempfile::tempdir().unwrap();
    let source = TensorBatches::new(vec![ArrayD::zeros(ndarray::IxDyn(&[1, 1, 8, 8]))]);

    let err = InferencePipeline::full_inference(
        &mut HalfModel,
        &source,
        target.path(),
        &Identity,
        &options(&[8, 8]),
        Device::Cpu,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, SegError::IncompatibleDataset(_)));

    let touched = Arc::new(AtomicUsize::new(0));
    let mut models = vec![ConstantModel::boxed(1.0, &touched)];
    let err = InferencePipeline::full_inference_ensemble(
        &mut models,
        &source,
        target.path(),
        &Identity,
        &options(&[8, 8]),
        &EnsembleOptions::default(),
        Device::Cpu,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, SegError::IncompatibleDataset(_)));
    assert_eq!(touched.load(Ordering::SeqCst), 0);
}

#[test]
fn empty_input_is_a_successful_no_op() {
    let target = tempfile::tempdir().unwrap();
    let empty = DataLoader::new(ImageDataset::from_paths(Vec::new()), 2).unwrap();

    let done = InferencePipeline::full_inference(
        &mut HalfModel,
        &empty,
        target.path(),
        &Identity,
        &options(&[8, 8]),
        Device::Cpu,
        None,
    )
    .unwrap();
    assert!(done);

    let touched = Arc::new(AtomicUsize::new(0));
    let mut models = vec![ConstantModel::boxed(1.0, &touched), ConstantModel::boxed(2.0, &touched)];
    let done = InferencePipeline::full_inference_ensemble(
        &mut models,
        &empty,
        target.path(),
        &Identity,
        &options(&[8, 8]),
        &EnsembleOptions::default(),
        Device::Cpu,
        None,
    )
    .unwrap();
    assert!(done);
    assert!(tiff_files(target.path()).is_empty());
    assert_eq!(touched.load(Ordering::SeqCst), 0);
}

/// 数据集只列出一个文件，却产生两个批次
struct OverrunningSource {
    dataset: ImageDataset,
}

impl BatchSource for OverrunningSource {
    fn dataset(&self) -> Option<&dyn ItemDataset> {
        Some(&self.dataset)
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<ArrayD<f32>>> + '_> {
        Box::new((0..2).map(|_| Ok(ArrayD::zeros(ndarray::IxDyn(&[1, 1, 8, 8])))))
    }
}

#[test]
fn sources_yielding_more_images_than_files_fail_without_rollback() {
    let input = tempfile::tempdir().unwrap();
    let source = OverrunningSource {
        dataset: ImageDataset::from_paths(vec![input.path().join("cells.tif")]),
    };

    let target = tempfile::tempdir().unwrap();
    let err = InferencePipeline::full_inference(
        &mut HalfModel,
        &source,
        target.path(),
        &Identity,
        &options(&[8, 8]),
        Device::Cpu,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, SegError::Internal(_)));
    assert_eq!(tiff_files(target.path()), vec!["pred_cells.tif".to_string()]);

    let target = tempfile::tempdir().unwrap();
    let touched = Arc::new(AtomicUsize::new(0));
    let mut models = vec![ConstantModel::boxed(1.0, &touched), ConstantModel::boxed(1.0, &touched)];
    let err = InferencePipeline::full_inference_ensemble(
        &mut models,
        &source,
        target.path(),
        &Identity,
        &options(&[8, 8]),
        &EnsembleOptions::default(),
        Device::Cpu,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, SegError::Internal(_)));
    assert_eq!(tiff_files(target.path()), vec!["ensemble_cells.tif".to_string()]);
}

/// 记录同一时刻有多少个模型位于加速设备上
struct ResidencyModel {
    on_device: bool,
    resident: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SegmentationModel for ResidencyModel {
    fn name(&self) -> &str {
        "residency"
    }

    fn forward(&self, input: ArrayView5<'_, f32>) -> Result<Array5<f32>> {
        assert!(self.on_device, "forward ran before the model was moved to the device");
        let (b, _, d, h, w) = input.dim();
        Ok(Array5::zeros((b, 1, d, h, w)))
    }

    fn to_device(&mut self, device: Device) -> Result<()> {
        let wanted = device != Device::Cpu;
        if wanted && !self.on_device {
            let now = self.resident.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        } else if !wanted && self.on_device {
            self.resident.fetch_sub(1, Ordering::SeqCst);
        }
        self.on_device = wanted;
        Ok(())
    }

    fn eval(&mut self) {}

    fn device(&self) -> Device {
        if self.on_device {
            Device::Cuda { device_id: 0 }
        } else {
            Device::Cpu
        }
    }
}

#[test]
fn ensemble_keeps_one_model_on_the_device_at_a_time() {
    let input = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    write_input(input.path(), "a", 8, 8);
    write_input(input.path(), "b", 8, 8);

    let resident = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut models: Vec<Box<dyn SegmentationModel>> = (0..3)
        .map(|_| {
            Box::new(ResidencyModel {
                on_device: false,
                resident: Arc::clone(&resident),
                peak: Arc::clone(&peak),
            }) as Box<dyn SegmentationModel>
        })
        .collect();

    InferencePipeline::full_inference_ensemble(
        &mut models,
        &loader_for(input.path()),
        target.path(),
        &Identity,
        &options(&[8, 8]),
        &EnsembleOptions::default(),
        Device::Cuda { device_id: 0 },
        None,
    )
    .unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(resident.load(Ordering::SeqCst), 0);
    assert_eq!(tiff_files(target.path()).len(), 2);
}
