//! Capture → detect → stream pipeline.
//!
//! The module is split into focused submodules:
//! - `config`: run configuration and detector settings.
//! - `driver`: the acquire/fan-out/release loop.
//! - `processor`: the stage interface the driver feeds.
//! - `detection`: asynchronous inference worker and frame annotation.
//! - `stream`: ffmpeg encoder sink.
//! - `annotation`: drawing primitives for detections.
//! - `shutdown`: Ctrl+C handling.
//! - `telemetry`: tracing subscribers and Prometheus metrics.

mod annotation;
mod config;
mod detection;
mod driver;
mod processor;
mod shutdown;
mod stream;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use video_ingest::{
    FfmpegSource, FfmpegSourceConfig, FrameSource, SourceStats, SyntheticConfig, SyntheticSource,
};

pub use annotation::{annotate_frame, label_text};
pub use config::{
    DEFAULT_DESTINATION, DetectorConfig, EncoderSettings, OutputConfig, OutputMode,
    PipelineConfig, SourceSelection, TelemetryOptions,
};
pub use detection::DetectionEngine;
pub use driver::{PipelineDriver, PipelineState, PipelineSummary};
pub use processor::FrameProcessor;
pub use shutdown::ShutdownToken;
pub use stream::{
    EncoderLauncher, EncoderSpec, FfmpegLauncher, SinkError, StreamSink, pixel_format_token,
};

/// Run the pipeline described by `config` until a stop condition is met.
pub fn run(config: PipelineConfig) -> Result<PipelineSummary> {
    config.validate()?;

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    if telemetry::init_metrics_recorder().is_none() {
        warn!("Prometheus recorder not installed; metrics are disabled");
    }
    let run_span = tracing::info_span!(
        "pipeline.run",
        source = ?config.source,
        width = config.width,
        height = config.height,
        frame_limit = ?config.frame_limit,
        detector = config.detector.is_some(),
        output = config.output.is_some()
    );
    let _run_guard = run_span.enter();

    let (mut source, source_stats) = build_source(&config);
    source.setup().context("Failed to set up capture source")?;
    source.start().context("Failed to start capture source")?;

    let mut processors: Vec<Box<dyn FrameProcessor>> = Vec::new();
    if let Some(detector) = &config.detector {
        let engine = DetectionEngine::new(detector);
        if !engine.has_backend() {
            warn!("No inference backend loaded; frames will pass through unannotated");
        }
        processors.push(Box::new(engine));
    }
    if let Some(output) = &config.output {
        info!("Sending {}", stream::describe(output));
        processors.push(Box::new(StreamSink::new(output.clone())));
    }

    let shutdown = ShutdownToken::new();
    shutdown.install_ctrlc_handler();

    let mut driver = PipelineDriver::new(source, processors, shutdown, config.frame_limit);
    let outcome = driver.run();
    drop(driver);

    if source_stats.outstanding() > 0 {
        warn!(
            "{} of {} acquired bundles were never released",
            source_stats.outstanding(),
            source_stats.acquired()
        );
    } else {
        debug!("Released all {} acquired bundles", source_stats.released());
    }
    let summary = outcome?;

    if let Some(path) = &config.telemetry.metrics_out {
        telemetry::write_metrics_snapshot(path)?;
        info!("Metrics snapshot written to {}", path.display());
    }

    Ok(summary)
}

fn build_source(config: &PipelineConfig) -> (Box<dyn FrameSource>, Arc<SourceStats>) {
    match &config.source {
        SourceSelection::Synthetic => {
            let source = SyntheticSource::new(SyntheticConfig {
                width: config.width,
                height: config.height,
                modalities: config.raw_modalities(),
                fps: config.fps,
                max_frames: None,
            });
            let stats = source.stats();
            (Box::new(source), stats)
        }
        SourceSelection::Device(uri) => {
            let binary = config
                .output
                .as_ref()
                .map(|output| output.encoder.binary.clone())
                .unwrap_or_else(|| EncoderSettings::default().binary);
            let source = FfmpegSource::new(FfmpegSourceConfig {
                uri: uri.clone(),
                width: config.width,
                height: config.height,
                fps: config.fps,
                binary,
                modalities: config.raw_modalities(),
            });
            let stats = source.stats();
            (Box::new(source), stats)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_run_releases_every_bundle() {
        let config = PipelineConfig {
            width: 8,
            height: 8,
            frame_limit: Some(3),
            ..Default::default()
        };
        let (mut source, stats) = build_source(&config);
        source.setup().unwrap();
        source.start().unwrap();
        let mut driver = PipelineDriver::new(source, Vec::new(), ShutdownToken::new(), Some(3));
        driver.run().unwrap();

        assert_eq!(stats.acquired(), 3);
        assert_eq!(stats.outstanding(), 0);
    }
}
