use std::{fmt, path::PathBuf, str::FromStr};

use thiserror::Error;

use crate::tensor::{InputBlob, OutputTensor};

/// How a network lays out its detections in the final output layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputLayerKind {
    /// Flat 7-float records `[batch, class, confidence, left, top, right, bottom]`.
    FixedRecord,
    /// One row per anchor: centre, size, objectness, then per-class scores.
    Grid,
    /// Anything else; produces no detections.
    Unknown(String),
}

impl OutputLayerKind {
    pub fn as_str(&self) -> &str {
        match self {
            OutputLayerKind::FixedRecord => "DetectionOutput",
            OutputLayerKind::Grid => "Region",
            OutputLayerKind::Unknown(name) => name,
        }
    }
}

impl fmt::Display for OutputLayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputLayerKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "DetectionOutput" | "detection-output" | "fixed" => OutputLayerKind::FixedRecord,
            "Region" | "region" | "grid" => OutputLayerKind::Grid,
            other => OutputLayerKind::Unknown(other.to_string()),
        })
    }
}

/// Static facts about a loaded network, learned once at load time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendInfo {
    /// Kinds of the unconnected output layers, in output order.
    pub layers: Vec<OutputLayerKind>,
    /// Backend already applies non-maximum suppression to grid outputs.
    pub suppresses_internally: bool,
}

impl BackendInfo {
    pub fn single(kind: OutputLayerKind) -> Self {
        Self {
            layers: vec![kind],
            suppresses_internally: false,
        }
    }

    /// Kind of the first output layer, which selects the decode layout.
    pub fn primary_kind(&self) -> Option<&OutputLayerKind> {
        self.layers.first()
    }
}

/// Forward pass of a detection network.
///
/// Implementations are moved onto the detection worker thread, hence `Send`.
pub trait InferenceBackend: Send {
    fn info(&self) -> &BackendInfo;

    fn forward(&mut self, input: &InputBlob) -> Result<Vec<OutputTensor>, InferenceError>;
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("failed to load model {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("invalid input: {0}")]
    Input(String),
    #[error("forward pass failed: {0}")]
    Forward(String),
    #[error("unexpected model output: {0}")]
    Output(String),
}
