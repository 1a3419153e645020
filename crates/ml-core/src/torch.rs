use std::path::Path;

use tch::{self, Device, IValue, Kind, Tensor};
use tracing::info;

use crate::{
    backend::{BackendInfo, InferenceBackend, InferenceError, OutputLayerKind},
    tensor::{InputBlob, OutputTensor},
};

/// TorchScript detection network.
///
/// The module is expected to return either one tensor or a tuple/list of
/// tensors, one per output layer. Each output is flattened to `rows x cols`
/// with `cols` taken from its last dimension.
pub struct TorchBackend {
    module: tch::CModule,
    device: Device,
    info: BackendInfo,
}

impl TorchBackend {
    /// Load a TorchScript module, on CUDA when available.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        layers: Vec<OutputLayerKind>,
    ) -> Result<Self, InferenceError> {
        let path = model_path.as_ref();
        let device = Device::cuda_if_available();
        let mut module =
            tch::CModule::load_on_device(path, device).map_err(|err| InferenceError::Load {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        module.set_eval();
        info!("Loaded TorchScript model {} on {device:?}", path.display());

        Ok(Self {
            module,
            device,
            info: BackendInfo {
                layers,
                suppresses_internally: false,
            },
        })
    }

    fn to_output(tensor: &Tensor) -> Result<OutputTensor, InferenceError> {
        let shape = tensor.size();
        let cols = shape.last().copied().unwrap_or(0).max(0) as usize;
        let flat = tensor
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .contiguous()
            .flatten(0, -1);
        let data = Vec::<f32>::try_from(&flat)
            .map_err(|err| InferenceError::Output(err.to_string()))?;
        if cols == 0 || data.len() % cols != 0 {
            return Err(InferenceError::Output(format!(
                "cannot view output shape {shape:?} as a matrix"
            )));
        }
        Ok(OutputTensor::new(data.len() / cols, cols, data))
    }

    fn collect(value: IValue, outputs: &mut Vec<OutputTensor>) -> Result<(), InferenceError> {
        match value {
            IValue::Tensor(tensor) => outputs.push(Self::to_output(&tensor)?),
            IValue::TensorList(tensors) => {
                for tensor in &tensors {
                    outputs.push(Self::to_output(tensor)?);
                }
            }
            IValue::Tuple(values) | IValue::GenericList(values) => {
                for value in values {
                    Self::collect(value, outputs)?;
                }
            }
            other => {
                return Err(InferenceError::Output(format!(
                    "unsupported module output {other:?}"
                )));
            }
        }
        Ok(())
    }
}

impl InferenceBackend for TorchBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn forward(&mut self, input: &InputBlob) -> Result<Vec<OutputTensor>, InferenceError> {
        let [n, c, h, w] = input.shape.map(|d| d as i64);
        let tensor = Tensor::from_slice(&input.data)
            .view([n, c, h, w])
            .to_device(self.device);

        let output = tch::no_grad(|| self.module.forward_is(&[IValue::Tensor(tensor)]))
            .map_err(|err| InferenceError::Forward(err.to_string()))?;

        let mut outputs = Vec::new();
        Self::collect(output, &mut outputs)?;
        Ok(outputs)
    }
}
