use crate::config::{Device, OnnxConfig};
use crate::models::SegmentationModel;
use crate::utils::error::SegError;
use crate::Result;
use ndarray::{Array5, ArrayView5, Axis, Ix5};
use ort::{
    inputs,
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::Tensor,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 基于ONNX Runtime的分割模型
pub struct OnnxModel {
    name: String,
    model_path: PathBuf,
    onnx_config: OnnxConfig,
    session: Arc<Mutex<Session>>,
    input_name: String,  // 动态发现的输入名称
    output_name: String, // 动态发现的输出名称
    spatial_dims: usize,
    device: Device,
    eval_mode: bool,
}

impl OnnxModel {
    pub fn load(
        model_path: &Path,
        spatial_dims: usize,
        onnx_config: &OnnxConfig,
        device: Device,
    ) -> Result<Self> {
        if !model_path.exists() {
            return Err(SegError::ModelLoad(format!(
                "Model not found: {}",
                model_path.display()
            )));
        }
        if spatial_dims != 2 && spatial_dims != 3 {
            return Err(SegError::Config(format!(
                "Model spatial dimensions must be 2 or 3, got {}",
                spatial_dims
            )));
        }

        tracing::info!("Loading model from: {} ({})", model_path.display(), device);

        let session = build_session(model_path, onnx_config, device)?;
        let (input_name, output_name) = discover_io_names(&session)?;

        let name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        Ok(Self {
            name,
            model_path: model_path.to_path_buf(),
            onnx_config: onnx_config.clone(),
            session: Arc::new(Mutex::new(session)),
            input_name,
            output_name,
            spatial_dims,
            device,
            eval_mode: false,
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn spatial_dims(&self) -> usize {
        self.spatial_dims
    }

    pub fn is_eval(&self) -> bool {
        self.eval_mode
    }
}

impl SegmentationModel for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: ArrayView5<'_, f32>) -> Result<Array5<f32>> {
        // 二维网络不接受深度轴，推理前去掉、推理后补回
        let input_tensor = if self.spatial_dims == 2 {
            if input.len_of(Axis(2)) != 1 {
                return Err(SegError::Geometry(format!(
                    "2D model '{}' received a window with depth {}",
                    self.name,
                    input.len_of(Axis(2))
                )));
            }
            Tensor::from_array(input.index_axis(Axis(2), 0).to_owned())?
        } else {
            Tensor::from_array(input.to_owned())?
        };

        // 推理 - 立即提取数据避免生命周期冲突
        let prediction = {
            let mut session = self.session.lock();
            let outputs = session.run(inputs![self.input_name.as_str() => input_tensor])?;

            match outputs.get(&self.output_name) {
                Some(output) => output.try_extract_array::<f32>()?.into_owned(),
                None => {
                    let available_outputs: Vec<String> =
                        outputs.keys().map(|s| s.to_string()).collect();
                    return Err(SegError::Inference(format!(
                        "Output '{}' not found. Available outputs: {:?}",
                        self.output_name, available_outputs
                    )));
                }
            }
        };

        let prediction = if self.spatial_dims == 2 {
            prediction.insert_axis(Axis(2))
        } else {
            prediction
        };

        prediction.into_dimensionality::<Ix5>().map_err(|e| {
            SegError::Inference(format!(
                "Model '{}' returned an unexpected output rank: {}",
                self.name, e
            ))
        })
    }

    fn to_device(&mut self, device: Device) -> Result<()> {
        if device == self.device {
            return Ok(());
        }

        tracing::debug!("Moving model '{}' from {} to {}", self.name, self.device, device);
        let session = build_session(&self.model_path, &self.onnx_config, device)?;
        self.session = Arc::new(Mutex::new(session));
        self.device = device;
        Ok(())
    }

    fn eval(&mut self) {
        // ONNX图本身只做推理，没有梯度状态需要关闭
        self.eval_mode = true;
    }

    fn device(&self) -> Device {
        self.device
    }
}

fn build_session(model_path: &Path, onnx_config: &OnnxConfig, device: Device) -> Result<Session> {
    let builder = Session::builder()?
        .with_optimization_level(optimization_level(onnx_config.optimization_level))?
        .with_intra_threads(onnx_config.intra_threads)?;

    let builder = configure_device(builder, device)?;
    Ok(builder.commit_from_file(model_path)?)
}

fn optimization_level(level: i32) -> GraphOptimizationLevel {
    match level {
        i32::MIN..=0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    }
}

fn configure_device(builder: SessionBuilder, device: Device) -> Result<SessionBuilder> {
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda { device_id } => configure_cuda(builder, device_id),
    }
}

fn configure_cuda(builder: SessionBuilder, device_id: u32) -> Result<SessionBuilder> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        Ok(builder.with_execution_providers([ep])?)
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = builder;
        Err(SegError::Config(format!(
            "CUDA device {} requested but onnx-seg was built without the `cuda` feature",
            device_id
        )))
    }
}

fn discover_io_names(session: &Session) -> Result<(String, String)> {
    let input_name = match session.inputs.first() {
        Some(input) => input.name.clone(),
        None => return Err(SegError::ModelLoad("Model has no inputs".to_string())),
    };

    let output_name = match session.outputs.first() {
        Some(output) => output.name.clone(),
        None => return Err(SegError::ModelLoad("Model has no outputs".to_string())),
    };

    tracing::info!("Model input: '{}', output: '{}'", input_name, output_name);
    for (i, output) in session.outputs.iter().enumerate() {
        tracing::debug!("Model output[{}]: '{}'", i, output.name);
    }

    Ok((input_name, output_name))
}
