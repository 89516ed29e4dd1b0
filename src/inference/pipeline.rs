use crate::{
    config::Device,
    data::{BatchSource, ItemDataset},
    image::{OutputImage, TiffWriter},
    inference::{
        geometry, EnsembleOptions, InferenceOptions, InferenceStage, InferenceStatus,
        PostTransform, SlidingWindowInferer, Voting,
    },
    models::SegmentationModel,
    utils::error::SegError,
    Result,
};
use ndarray::{ArrayD, Axis};
use std::path::Path;
use std::time::Instant;
use tokio::sync::mpsc;

/// 全图推理流水线：滑窗推理、后处理、（集成投票）、写出TIFF
pub struct InferencePipeline;

impl InferencePipeline {
    /// 单模型全图推理
    ///
    /// 数据来源必须可按文件寻址且不打乱顺序，输出文件名为 `{prefix}{stem}.tif`。
    pub fn full_inference(
        model: &mut dyn SegmentationModel,
        source: &dyn BatchSource,
        target_folder: &Path,
        post: &dyn PostTransform,
        options: &InferenceOptions,
        device: Device,
        status_tx: Option<&mpsc::UnboundedSender<InferenceStatus>>,
    ) -> Result<bool> {
        let start_time = Instant::now();
        let inferer = SlidingWindowInferer::from_options(options)?;

        std::fs::create_dir_all(target_folder)?;
        let dataset = require_dataset(source)?;
        if dataset.is_empty() {
            tracing::warn!("No input files provided to process. Quitting.");
            return Ok(true);
        }
        let total = dataset.len();

        send_status(
            status_tx,
            InferenceStatus::new(InferenceStage::Preparing, 0.0, "Preparing model")
                .with_images(0, total),
        );

        model.to_device(device)?;
        model.eval();
        tracing::info!("Running full inference with model '{}' on {}", model.name(), device);

        let mut counter = 0;
        for batch in source.batches() {
            send_status(
                status_tx,
                InferenceStatus::new(
                    InferenceStage::Inference,
                    progress(counter, total),
                    "Running sliding window inference",
                )
                .with_images(counter, total),
            );

            let outputs = Self::predict_batch(&*model, &inferer, post, batch?)?;

            for pred in split_images(outputs, options.transpose) {
                let stem = item_stem(dataset, counter)?;
                let output_name = target_folder.join(format!("{}{}.tif", options.prefix, stem));
                save_prediction(&output_name, OutputImage::from_f32(pred, options.output_dtype))?;
                counter += 1;

                send_status(
                    status_tx,
                    InferenceStatus::new(
                        InferenceStage::Writing,
                        progress(counter, total),
                        &format!("Saved {}", output_name.display()),
                    )
                    .with_images(counter, total),
                );
            }
        }

        warn_if_incomplete(counter, total);
        tracing::info!(
            "Prediction completed. images={}, total_time={:.3}s",
            counter,
            start_time.elapsed().as_secs_f32()
        );
        send_status(
            status_tx,
            InferenceStatus::new(InferenceStage::Completed, 1.0, "Prediction completed.")
                .with_images(counter, total),
        );

        Ok(true)
    }

    /// 集成全图推理
    ///
    /// 每个批次依次由每个模型推理，再逐图像投票，输出 `{ensemble_prefix}{stem}.tif`；
    /// 可选地把每个模型的预测写入 `fold_{i}/{prefix}{stem}.tif`。
    #[allow(clippy::too_many_arguments)]
    pub fn full_inference_ensemble(
        models: &mut [Box<dyn SegmentationModel>],
        source: &dyn BatchSource,
        target_folder: &Path,
        post: &dyn PostTransform,
        options: &InferenceOptions,
        ensemble: &EnsembleOptions,
        device: Device,
        status_tx: Option<&mpsc::UnboundedSender<InferenceStatus>>,
    ) -> Result<bool> {
        let start_time = Instant::now();

        // 在接触任何模型之前完成参数校验
        let voting = Voting::resolve(
            ensemble.voting_mechanism,
            ensemble.weights.as_deref(),
            models.len(),
        )?;
        if models.is_empty() {
            return Err(SegError::Config(
                "Ensemble inference requires at least one model".to_string(),
            ));
        }
        let inferer = SlidingWindowInferer::from_options(options)?;

        std::fs::create_dir_all(target_folder)?;
        let dataset = require_dataset(source)?;
        if dataset.is_empty() {
            tracing::warn!("No input files provided to process. Quitting.");
            return Ok(true);
        }
        let total = dataset.len();

        let fold_folders = if ensemble.save_individual_preds {
            let folders = (0..models.len())
                .map(|f| target_folder.join(format!("fold_{}", f)))
                .collect::<Vec<_>>();
            for folder in &folders {
                std::fs::create_dir_all(folder)?;
            }
            folders
        } else {
            Vec::new()
        };

        send_status(
            status_tx,
            InferenceStatus::new(InferenceStage::Preparing, 0.0, "Preparing models")
                .with_images(0, total),
        );

        for model in models.iter_mut() {
            model.eval();
        }
        tracing::info!(
            "Running ensemble inference with {} models ({} voting) on {}",
            models.len(),
            ensemble.voting_mechanism,
            device
        );

        let n_models = models.len();
        let release_device = n_models > 1 && device != Device::Cpu;
        let mut counter = 0;
        for batch in source.batches() {
            let batch = batch?;

            // per_image[b][n]：第b张图像在第n个模型下的预测
            let mut per_image: Vec<Vec<ArrayD<f32>>> = Vec::new();
            for (n, model) in models.iter_mut().enumerate() {
                send_status(
                    status_tx,
                    InferenceStatus::new(
                        InferenceStage::Inference,
                        progress(counter, total),
                        &format!("Running model {} of {}", n + 1, n_models),
                    )
                    .with_images(counter, total),
                );

                model.to_device(device)?;
                tracing::debug!("Model {} ('{}') on {}", n, model.name(), device);

                let outputs = Self::predict_batch(&**model, &inferer, post, batch.clone())?;
                // 设备上同一时刻只保留一个模型
                if release_device {
                    model.to_device(Device::Cpu)?;
                }
                let images = split_images(outputs, options.transpose);

                if n == 0 {
                    per_image = images.into_iter().map(|image| vec![image]).collect();
                } else if images.len() != per_image.len() {
                    return Err(SegError::Inference(format!(
                        "Model {} produced {} images for a batch where model 0 produced {}",
                        n,
                        images.len(),
                        per_image.len()
                    )));
                } else {
                    for (slot, image) in per_image.iter_mut().zip(images) {
                        slot.push(image);
                    }
                }
            }

            for predictions in per_image {
                let stem = item_stem(dataset, counter)?;

                send_status(
                    status_tx,
                    InferenceStatus::new(
                        InferenceStage::Voting,
                        progress(counter, total),
                        &format!("Voting on {}", stem),
                    )
                    .with_images(counter, total),
                );
                let ensemble_pred = voting.vote(&predictions)?;

                let output_name =
                    target_folder.join(format!("{}{}.tif", ensemble.ensemble_prefix, stem));
                save_prediction(
                    &output_name,
                    OutputImage::from_i32(ensemble_pred, options.output_dtype),
                )?;

                for (folder, pred) in fold_folders.iter().zip(predictions) {
                    let fold_name = folder.join(format!("{}{}.tif", options.prefix, stem));
                    save_prediction(&fold_name, OutputImage::from_f32(pred, options.output_dtype))?;
                }

                counter += 1;
                send_status(
                    status_tx,
                    InferenceStatus::new(
                        InferenceStage::Writing,
                        progress(counter, total),
                        &format!("Saved {}", output_name.display()),
                    )
                    .with_images(counter, total),
                );
            }
        }

        warn_if_incomplete(counter, total);
        tracing::info!(
            "Ensemble prediction completed. images={}, models={}, total_time={:.3}s",
            counter,
            models.len(),
            start_time.elapsed().as_secs_f32()
        );
        send_status(
            status_tx,
            InferenceStatus::new(InferenceStage::Completed, 1.0, "Ensemble prediction completed.")
                .with_images(counter, total),
        );

        Ok(true)
    }

    /// 规范化、滑窗推理、恢复布局、后处理
    fn predict_batch(
        model: &dyn SegmentationModel,
        inferer: &SlidingWindowInferer,
        post: &dyn PostTransform,
        batch: ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        let (inputs, spatial_dims) = geometry::normalize(batch, true)?;
        tracing::debug!("Batch shape: {:?}", inputs.shape());

        let outputs = inferer.infer(inputs.view(), model)?;
        post.apply(geometry::restore(outputs, spatial_dims, true)?)
    }
}

fn require_dataset(source: &dyn BatchSource) -> Result<&dyn ItemDataset> {
    source.dataset().ok_or_else(|| {
        SegError::IncompatibleDataset(
            "the batch source does not expose the file names of its items".to_string(),
        )
    })
}

/// 第 `counter` 个输出对应的输入文件名
fn item_stem(dataset: &dyn ItemDataset, counter: usize) -> Result<String> {
    dataset.stem(counter).ok_or_else(|| {
        SegError::Internal(format!(
            "The batch source yielded more images than the {} file(s) in its dataset",
            dataset.len()
        ))
    })
}

/// 拆分批次为单张图像：去掉单例通道轴，必要时反转所有轴
fn split_images(outputs: ArrayD<f32>, transpose: bool) -> Vec<ArrayD<f32>> {
    outputs
        .outer_iter()
        .map(|pred| {
            let mut pred = pred.to_owned();
            if pred.ndim() > 2 && pred.len_of(Axis(0)) == 1 {
                pred = pred.index_axis_move(Axis(0), 0);
            }
            if transpose {
                pred = pred.reversed_axes();
            }
            pred
        })
        .collect()
}

fn save_prediction(output_name: &Path, image: OutputImage) -> Result<()> {
    TiffWriter::write(output_name, &image)?;
    tracing::info!("Saved {}.", output_name.display());
    Ok(())
}

fn warn_if_incomplete(counter: usize, total: usize) {
    if counter < total {
        tracing::warn!(
            "The batch source yielded {} image(s) for a dataset of {} file(s)",
            counter,
            total
        );
    }
}

fn progress(done: usize, total: usize) -> f32 {
    if total == 0 {
        1.0
    } else {
        done as f32 / total as f32
    }
}

/// 状态通道是尽力而为的，接收端关闭不影响推理
fn send_status(
    status_tx: Option<&mpsc::UnboundedSender<InferenceStatus>>,
    status: InferenceStatus,
) {
    if let Some(tx) = status_tx {
        let _ = tx.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn split_drops_singleton_channels_only() {
        let outputs = ArrayD::<f32>::zeros(IxDyn(&[2, 1, 3, 4]));
        let images = split_images(outputs, false);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].shape(), &[3, 4]);

        let multi = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 3, 4]));
        assert_eq!(split_images(multi, false)[0].shape(), &[2, 3, 4]);
    }

    #[test]
    fn transpose_reverses_every_axis() {
        let outputs = ArrayD::from_shape_fn(IxDyn(&[1, 1, 2, 3, 4]), |ix| ix[4] as f32);
        let images = split_images(outputs, true);
        assert_eq!(images[0].shape(), &[4, 3, 2]);
        assert_eq!(images[0][[3, 0, 0]], 3.0);
    }

    #[test]
    fn progress_is_a_fraction() {
        assert_eq!(progress(1, 4), 0.25);
        assert_eq!(progress(0, 0), 1.0);
    }

    #[test]
    fn closed_status_channel_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        send_status(Some(&tx), InferenceStatus::new(InferenceStage::Completed, 1.0, "done"));
    }
}
