//! Deterministic test-pattern source.
//!
//! Produces every raw modality needed by the requested set: a scrolling BGR
//! gradient for colour, a float ramp in millimetres for depth and an 8-bit ramp
//! for infrared. Useful for running the pipeline without a device attached.

use std::{
    collections::BTreeSet,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::{
    source::{FrameSource, SourceStats},
    types::{CaptureError, Frame, FrameBundle, Modality, PixelFormat},
};

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub modalities: Vec<Modality>,
    /// Pace bundles at this rate; `None` produces them as fast as requested.
    pub fps: Option<u32>,
    /// End the stream after this many bundles.
    pub max_frames: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            modalities: vec![Modality::Color],
            fps: None,
            max_frames: None,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    raw: Vec<Modality>,
    ready: bool,
    running: bool,
    produced: u64,
    next_due: Option<Instant>,
    stats: Arc<SourceStats>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let raw: BTreeSet<Modality> = config
            .modalities
            .iter()
            .flat_map(|m| m.components().iter().copied())
            .collect();
        Self {
            config,
            raw: raw.into_iter().collect(),
            ready: false,
            running: false,
            produced: 0,
            next_due: None,
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        self.stats.clone()
    }

    fn frame_interval(&self) -> Option<Duration> {
        self.config
            .fps
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps as f64))
    }

    fn render(&self, modality: Modality, sequence: u64) -> Result<Frame, CaptureError> {
        let (width, height) = (self.config.width, self.config.height);
        let shift = sequence as usize;
        let pixels = width as usize * height as usize;

        let (format, data) = match modality {
            Modality::Depth => {
                let mut data = Vec::with_capacity(pixels * 4);
                for y in 0..height as usize {
                    for x in 0..width as usize {
                        let mm = 500.0 + ((x + y + shift) % 4000) as f32;
                        data.extend_from_slice(&mm.to_le_bytes());
                    }
                }
                (PixelFormat::Float32, data)
            }
            Modality::Infrared => {
                let mut data = Vec::with_capacity(pixels);
                for y in 0..height as usize {
                    for x in 0..width as usize {
                        data.push(((x * 2 + y + shift) % 256) as u8);
                    }
                }
                (PixelFormat::Gray8, data)
            }
            _ => {
                let mut data = Vec::with_capacity(pixels * 3);
                for y in 0..height as usize {
                    for x in 0..width as usize {
                        data.push(((x + shift) % 256) as u8);
                        data.push(((y + shift) % 256) as u8);
                        data.push(((x + y) % 256) as u8);
                    }
                }
                (PixelFormat::Bgr8, data)
            }
        };

        Frame::new(modality, width, height, format, data)
    }
}

impl FrameSource for SyntheticSource {
    fn setup(&mut self) -> Result<(), CaptureError> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(CaptureError::NoDevice);
        }
        self.ready = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if !self.ready {
            return Err(CaptureError::NotSetUp);
        }
        self.running = true;
        self.next_due = Some(Instant::now());
        Ok(())
    }

    fn acquire(&mut self, block: bool) -> Result<FrameBundle, CaptureError> {
        if !self.running {
            return Err(CaptureError::NotRunning);
        }
        if self
            .config
            .max_frames
            .is_some_and(|max| self.produced >= max)
        {
            return Err(CaptureError::Closed);
        }

        if let (Some(interval), Some(due)) = (self.frame_interval(), self.next_due) {
            let now = Instant::now();
            if now < due {
                if !block {
                    return Ok(FrameBundle::default());
                }
                thread::sleep(due - now);
            }
            self.next_due = Some(due + interval);
        }

        self.produced += 1;
        let sequence = self.produced;
        let timestamp_ms = Utc::now().timestamp_millis();
        let mut bundle = FrameBundle::new(sequence, timestamp_ms);
        for modality in &self.raw {
            let frame = self
                .render(*modality, sequence)?
                .with_sequence(sequence)
                .with_timestamp(timestamp_ms);
            bundle.insert(frame);
        }
        self.stats.record_acquire();
        Ok(bundle)
    }

    fn release(&mut self, bundle: FrameBundle) {
        if !bundle.is_empty() {
            self.stats.record_release();
        }
    }

    fn stop(&mut self) {
        self.running = false;
    }
}
