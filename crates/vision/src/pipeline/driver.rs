use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use video_ingest::FrameSource;

use crate::pipeline::{processor::FrameProcessor, shutdown::ShutdownToken};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Stopping,
    Stopped,
}

/// Totals reported once the driver stops.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineSummary {
    pub frames: u64,
    pub elapsed: Duration,
}

impl PipelineSummary {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for PipelineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Read {} frames in {:.2} sec -> {:.2} fps",
            self.frames,
            self.elapsed.as_secs_f64(),
            self.fps()
        )
    }
}

/// Pulls bundles from a source and fans them out to processors until a stop
/// condition is met.
pub struct PipelineDriver {
    source: Box<dyn FrameSource>,
    processors: Vec<Box<dyn FrameProcessor>>,
    shutdown: ShutdownToken,
    frame_limit: Option<u64>,
    state: PipelineState,
    frames: u64,
}

impl PipelineDriver {
    /// `source` must already be set up and started.
    pub fn new(
        source: Box<dyn FrameSource>,
        processors: Vec<Box<dyn FrameProcessor>>,
        shutdown: ShutdownToken,
        frame_limit: Option<u64>,
    ) -> Self {
        Self {
            source,
            processors,
            shutdown,
            frame_limit,
            state: PipelineState::Running,
            frames: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Drive the pipeline to completion. Processors are dropped and the source
    /// stopped before returning, whether the run ended normally or on a source error.
    pub fn run(&mut self) -> Result<PipelineSummary> {
        match self.frame_limit {
            Some(limit) => info!("Will only read {limit} frames"),
            None => info!("Will read frames until interrupted"),
        }

        let started = Instant::now();
        let mut last_frame = started;
        let mut smoothed_fps = 0.0f64;
        let mut outcome = Ok(());

        while self.state == PipelineState::Running {
            let mut bundle = match self.source.acquire(true) {
                Ok(bundle) => bundle,
                Err(err) => {
                    outcome = Err(err).context("Failed to acquire frames");
                    self.state = PipelineState::Stopping;
                    break;
                }
            };

            if bundle.is_empty() {
                self.source.release(bundle);
                if self.shutdown.is_triggered() {
                    self.state = PipelineState::Stopping;
                }
                continue;
            }

            let frame_number = self.frames + 1;
            let span = tracing::info_span!(
                "frame",
                frame = frame_number,
                sequence = bundle.sequence,
                modalities = bundle.len()
            );
            let _frame_guard = span.enter();
            metrics::counter!("vision_frames_acquired_total").increment(1);

            for processor in self.processors.iter_mut() {
                processor.process_frame(&mut bundle);
            }
            while !self.processors.iter().all(|p| p.finished_with_frame()) {
                thread::yield_now();
            }
            self.source.release(bundle);
            self.frames = frame_number;

            let now = Instant::now();
            let interval = now.duration_since(last_frame).as_secs_f64();
            last_frame = now;
            if interval > 0.0 {
                let instant = 1.0 / interval;
                smoothed_fps = if smoothed_fps == 0.0 {
                    instant
                } else {
                    0.9 * smoothed_fps + 0.1 * instant
                };
                metrics::gauge!("vision_pipeline_fps").set(smoothed_fps);
            }
            if self.frames % 30 == 0 {
                debug!("Heartbeat: frame #{}, {smoothed_fps:.1} fps", self.frames);
            }

            if !self.processors.is_empty()
                && self.processors.iter().all(|p| p.finished_processing())
            {
                info!("All frame processors are done processing forever, stopping");
                self.state = PipelineState::Stopping;
            }
            if self.frame_limit.is_some_and(|limit| self.frames >= limit) {
                info!("Read {} frames, stopping", self.frames);
                self.state = PipelineState::Stopping;
            }
            if self.shutdown.is_triggered() {
                info!("Shutdown requested");
                self.state = PipelineState::Stopping;
            }
        }

        let summary = PipelineSummary {
            frames: self.frames,
            elapsed: started.elapsed(),
        };
        info!("Shutting down");
        self.teardown();
        info!("Done shutting down, {summary}");

        outcome.map(|()| summary)
    }

    fn teardown(&mut self) {
        // Registration order: workers are joined and pipes closed one by one.
        for processor in self.processors.drain(..) {
            debug!("Dropping processor {}", processor.name());
            drop(processor);
        }
        self.source.stop();
        self.state = PipelineState::Stopped;
    }
}

impl Drop for PipelineDriver {
    fn drop(&mut self) {
        if self.state != PipelineState::Stopped {
            warn!("Pipeline dropped while {:?}, tearing down", self.state);
            self.teardown();
        }
    }
}
