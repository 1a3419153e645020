//! Depth camera pipeline: frames are pulled from a capture source, optionally
//! annotated with detections from a background inference worker, and piped into
//! an ffmpeg encoder.

pub mod pipeline;
