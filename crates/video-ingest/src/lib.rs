//! Frame model and capture sources.
//!
//! A [`FrameSource`] hands out [`FrameBundle`]s (every modality captured at one
//! instant) and takes them back once the pipeline is done with them. Two sources
//! ship with the crate: [`FfmpegSource`] decodes a camera or stream through an
//! ffmpeg child process, [`SyntheticSource`] renders test patterns.

mod ffmpeg;
mod source;
mod synthetic;
mod types;

pub use ffmpeg::{FfmpegSource, FfmpegSourceConfig};
pub use source::{FrameSource, SourceStats};
pub use synthetic::{SyntheticConfig, SyntheticSource};
pub use types::{CaptureError, Frame, FrameBundle, Modality, PixelFormat};
