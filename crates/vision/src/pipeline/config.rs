//! Configuration consumed by the pipeline.
//!
//! The binary translates CLI flags into a [`PipelineConfig`]; every stage reads
//! its settings from here without re-parsing flags. Detector settings can also
//! be loaded from a JSON document.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use ml_core::{OutputLayerKind, PostprocessConfig};
use serde::Deserialize;
use video_ingest::Modality;

pub const DEFAULT_DESTINATION: &str = "127.0.0.1:8044";

#[derive(Clone, Debug, PartialEq, Eq)]
/// Where frames come from.
pub enum SourceSelection {
    /// Built-in test pattern generator.
    Synthetic,
    /// V4L device index, device path or any URI ffmpeg can open.
    Device(String),
}

impl SourceSelection {
    pub fn from_arg(value: &str) -> Self {
        if value.eq_ignore_ascii_case("synthetic") {
            SourceSelection::Synthetic
        } else {
            SourceSelection::Device(value.to_string())
        }
    }
}

#[derive(Clone, Debug)]
/// Canonical configuration for one pipeline run. Immutable once the run starts.
pub struct PipelineConfig {
    pub source: SourceSelection,
    /// Capture width in pixels.
    pub width: u32,
    /// Capture height in pixels.
    pub height: u32,
    /// Requested capture rate; `None` lets the source decide.
    pub fps: Option<u32>,
    /// Modalities the source is asked to stream.
    pub modalities: Vec<Modality>,
    /// Stop after this many frames; `None` runs until interrupted.
    pub frame_limit: Option<u64>,
    pub output: Option<OutputConfig>,
    pub detector: Option<DetectorConfig>,
    pub telemetry: TelemetryOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceSelection::Synthetic,
            width: 640,
            height: 480,
            fps: None,
            modalities: vec![Modality::Color],
            frame_limit: None,
            output: None,
            detector: None,
            telemetry: TelemetryOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            bail!("Capture width and height must be positive integers");
        }
        if self.modalities.is_empty() {
            bail!("At least one modality must be requested");
        }
        if self.frame_limit == Some(0) {
            bail!("Frame limit must be at least 1");
        }
        if let Some(output) = &self.output {
            if output.destination.is_empty() {
                bail!("Output destination must not be empty");
            }
            let raw = self.raw_modalities();
            let missing = output
                .modality
                .components()
                .iter()
                .find(|m| !raw.contains(*m));
            if let Some(missing) = missing {
                bail!(
                    "Output modality {} needs {missing} frames, which are not requested",
                    output.modality
                );
            }
        }
        if let Some(detector) = &self.detector {
            detector.validate()?;
        }
        Ok(())
    }

    /// Raw modalities the source must produce to satisfy every requested one.
    pub fn raw_modalities(&self) -> Vec<Modality> {
        let mut raw: Vec<Modality> = self
            .modalities
            .iter()
            .flat_map(|m| m.components().iter().copied())
            .collect();
        raw.sort();
        raw.dedup();
        raw
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Encode and send as RTP to `host:port`.
    Stream,
    /// Write a numbered PNG sequence to a path pattern.
    Sequence,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderSettings {
    /// ffmpeg binary to launch.
    pub binary: String,
    /// Video codec used in stream mode.
    pub codec: String,
    /// Where ffmpeg writes the SDP description in stream mode.
    pub sdp_file: PathBuf,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".into(),
            codec: "h264_nvmpi".into(),
            sdp_file: PathBuf::from("saved_sdp_file"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputConfig {
    pub modality: Modality,
    pub mode: OutputMode,
    /// `host:port` in stream mode, path pattern in sequence mode.
    pub destination: String,
    /// Frames to write before the sink reports done; `None` is unbounded.
    pub frame_limit: Option<u64>,
    pub encoder: EncoderSettings,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
/// Detector settings; any field missing from a JSON document keeps its default.
pub struct DetectorConfig {
    /// Serialized network weights.
    pub model: Option<PathBuf>,
    /// Sidecar describing the network's output layers, one layer type per line.
    pub model_config: Option<PathBuf>,
    /// Newline-delimited class names.
    pub classes: Option<PathBuf>,
    /// Output layer type used when no model config is given.
    pub output_layer: String,
    /// Side of the square cropped from each frame and fed to the network.
    pub input_size: u32,
    /// Multiplier applied to every 8-bit sample.
    pub scale: f32,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: None,
            model_config: None,
            classes: None,
            output_layer: "DetectionOutput".into(),
            input_size: 640,
            scale: 0.00392,
            conf_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

impl DetectorConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read detector config {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Failed to parse detector config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            bail!("Detector input size must be positive");
        }
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            bail!("Confidence threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.nms_threshold) {
            bail!("NMS threshold must be within [0, 1]");
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            bail!("Input scale must be a positive number");
        }
        Ok(())
    }

    pub fn postprocess(&self) -> PostprocessConfig {
        PostprocessConfig {
            conf_threshold: self.conf_threshold,
            nms_threshold: self.nms_threshold,
        }
    }

    /// Output layer kinds, read from the model config when one is given.
    pub fn output_layers(&self) -> Result<Vec<OutputLayerKind>> {
        let Some(path) = &self.model_config else {
            return Ok(vec![parse_layer(&self.output_layer)]);
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config {}", path.display()))?;
        let layers: Vec<OutputLayerKind> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(parse_layer)
            .collect();
        if layers.is_empty() {
            bail!("Model config {} lists no output layers", path.display());
        }
        Ok(layers)
    }
}

fn parse_layer(name: &str) -> OutputLayerKind {
    match name.parse() {
        Ok(kind) => kind,
        Err(never) => match never {},
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and metrics.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Write the Prometheus metrics snapshot here when the run ends.
    pub metrics_out: Option<PathBuf>,
}
