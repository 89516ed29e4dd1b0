use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use onnx_seg::{
    config::{Config, OptionsFile},
    data::{DataLoader, ImageDataset, ItemDataset},
    image::OutputDtype,
    inference::{
        Argmax, Compose, Identity, InferencePipeline, InferenceStatus, PostTransform, RoiSize,
        Sigmoid, Softmax, Threshold,
    },
    models::ModelManager,
};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "onnx-seg")]
#[command(about = "Full-image sliding window inference with ONNX segmentation models")]
struct Args {
    /// ONNX model file; repeat for an ensemble (one per fold)
    #[arg(long = "model", required = true)]
    models: Vec<PathBuf>,

    /// Folder with the images to predict
    #[arg(long)]
    input: PathBuf,

    /// Folder where predictions are written
    #[arg(long)]
    output: PathBuf,

    /// Device: cpu, cuda or cuda:N
    #[arg(long, default_value = "cpu")]
    device: String,

    /// Spatial dimensions of the models (2 or 3)
    #[arg(long, default_value_t = 2)]
    spatial_dims: usize,

    /// Number of images per batch
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// JSON file with "inference" and "ensemble" options
    #[arg(long)]
    options: Option<PathBuf>,

    /// Sliding window size, e.g. 256,256 or 32,128,128
    #[arg(long, value_delimiter = ',')]
    roi_size: Option<Vec<usize>>,

    /// Number of windows per forward pass
    #[arg(long)]
    sw_batch_size: Option<usize>,

    /// Fraction of overlap between windows
    #[arg(long)]
    overlap: Option<f32>,

    /// Output data type, e.g. uint8, int32, float32
    #[arg(long)]
    output_dtype: Option<String>,

    /// Prefix of the prediction file names
    #[arg(long)]
    prefix: Option<String>,

    /// Reverse all axes before saving
    #[arg(long)]
    transpose: bool,

    /// Ensemble voting mechanism: mode or mean
    #[arg(long)]
    voting: Option<String>,

    /// Ensemble weights for mean voting, e.g. 0.5,0.3,0.2
    #[arg(long, value_delimiter = ',')]
    weights: Option<Vec<f32>>,

    /// Also save the prediction of every model in fold_<i>
    #[arg(long)]
    save_individual_preds: bool,

    /// Prefix of the ensemble file names
    #[arg(long)]
    ensemble_prefix: Option<String>,

    /// Transform applied to the full-image network output
    #[arg(long, value_enum, default_value_t = PostKind::Argmax)]
    post: PostKind,

    /// Number of ONNX Runtime intra-op threads
    #[arg(long)]
    threads: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PostKind {
    /// Softmax + argmax over the channels (label image)
    Argmax,
    /// Sigmoid + 0.5 threshold (binary mask)
    Binary,
    /// Raw network output (regression)
    Raw,
}

impl PostKind {
    fn build(self) -> Box<dyn PostTransform> {
        match self {
            PostKind::Argmax => Box::new(Compose::new().then(Softmax).then(Argmax)),
            PostKind::Binary => Box::new(Compose::new().then(Sigmoid).then(Threshold(0.5))),
            PostKind::Raw => Box::new(Identity),
        }
    }

    /// 原始输出（回归值）保存为整数类型时会被截断
    fn truncated_by(self, dtype: Option<OutputDtype>) -> bool {
        matches!(self, PostKind::Raw) && dtype.is_some_and(|d| d.is_integer())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志系统
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_target(false)
        .init();

    let config = build_config(&args)?;
    tracing::info!("Input folder: {}", config.input_dir.display());
    tracing::info!("Target folder: {}", config.target_folder.display());

    let models = ModelManager::load_models(&config)?;
    let stats = ModelManager::stats(&config, &models);
    tracing::info!("Model stats: {}", serde_json::to_string(&stats)?);

    let dataset = ImageDataset::from_dir(&config.input_dir)?;
    tracing::info!("Found {} image(s) to process", dataset.len());
    let loader = DataLoader::new(dataset, config.loader_batch_size)?;
    let post = args.post.build();

    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<InferenceStatus>();

    // 推理是同步计算，放到阻塞线程池中运行
    let handle = tokio::task::spawn_blocking(move || {
        let mut models = models;
        if config.is_ensemble() {
            InferencePipeline::full_inference_ensemble(
                &mut models,
                &loader,
                &config.target_folder,
                &*post,
                &config.inference,
                &config.ensemble,
                config.device,
                Some(&status_tx),
            )
        } else {
            InferencePipeline::full_inference(
                &mut *models[0],
                &loader,
                &config.target_folder,
                &*post,
                &config.inference,
                config.device,
                Some(&status_tx),
            )
        }
    });

    while let Some(status) = status_rx.recv().await {
        tracing::debug!(
            "[{:?}] {:.0}% ({}/{}) {}",
            status.stage,
            status.progress * 100.0,
            status.processed_images,
            status.total_images,
            status.message
        );
    }

    match handle.await.context("Inference task panicked")? {
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::error!("Inference failed [{}]: {}", e.error_code(), e);
            if e.is_fail_fast() {
                tracing::error!("Run rejected before any device work, no predictions were written");
            }
            Err(e.into())
        }
    }
}

/// 命令行参数优先于参数文件
fn build_config(args: &Args) -> Result<Config> {
    let mut config = Config::new(
        args.models.clone(),
        args.input.clone(),
        args.output.clone(),
        &args.device,
        args.spatial_dims,
        args.batch_size,
    )?;

    if let Some(path) = &args.options {
        let options = OptionsFile::from_path(path)
            .with_context(|| format!("Failed to read options from {}", path.display()))?;
        config = config.with_options_file(options);
    }

    let inference = &mut config.inference;
    if let Some(roi_size) = &args.roi_size {
        inference.roi_size = RoiSize::new(roi_size)?;
    }
    if let Some(sw_batch_size) = args.sw_batch_size {
        inference.sw_batch_size = sw_batch_size;
    }
    if let Some(overlap) = args.overlap {
        inference.overlap = overlap;
    }
    if let Some(dtype) = &args.output_dtype {
        inference.output_dtype = Some(dtype.parse()?);
    }
    if let Some(prefix) = &args.prefix {
        inference.prefix = prefix.clone();
    }
    if args.transpose {
        inference.transpose = true;
    }

    let ensemble = &mut config.ensemble;
    if let Some(voting) = &args.voting {
        ensemble.voting_mechanism = voting.parse()?;
    }
    if let Some(weights) = &args.weights {
        ensemble.weights = Some(weights.clone());
    }
    if args.save_individual_preds {
        ensemble.save_individual_preds = true;
    }
    if let Some(prefix) = &args.ensemble_prefix {
        ensemble.ensemble_prefix = prefix.clone();
    }

    if let Some(dtype) = config.inference.output_dtype {
        if args.post.truncated_by(Some(dtype)) {
            tracing::warn!("Raw network outputs will be truncated to {}", dtype);
        }
    }

    if let Some(threads) = args.threads {
        config.onnx_config.intra_threads = threads.max(1);
    }

    if config.inference.roi_size.spatial_dims() != config.spatial_dims {
        anyhow::bail!(
            "ROI size {:?} does not match {}D models",
            config.inference.roi_size.extents(),
            config.spatial_dims
        );
    }

    Ok(config)
}
