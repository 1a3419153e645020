//! Detection model plumbing shared by the pipeline.
//!
//! Host-side preprocessing into an NCHW blob, the [`InferenceBackend`] contract,
//! decoding of raw network outputs and per-class non-maximum suppression. The
//! TorchScript backend is available behind the `with-tch` feature.

mod backend;
mod classes;
mod detection;
mod nms;
mod postprocess;
mod tensor;
#[cfg(feature = "with-tch")]
mod torch;

pub use backend::{BackendInfo, InferenceBackend, InferenceError, OutputLayerKind};
pub use classes::{ClassNames, ClassTableError};
pub use detection::{Detection, Rect};
pub use nms::{nms_boxes, suppress_per_class};
pub use postprocess::{PostprocessConfig, postprocess};
pub use tensor::{InputBlob, OutputTensor, PixelLayout, preprocess};
#[cfg(feature = "with-tch")]
pub use torch::TorchBackend;

#[cfg(feature = "with-tch")]
pub use tch;
