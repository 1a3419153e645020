//! ffmpeg-backed capture source.
//!
//! The camera (or any URI ffmpeg can open) is decoded by a child process that
//! writes raw BGR frames to stdout. A reader thread slices the byte stream into
//! frames and forwards them over a small bounded channel.

use std::{
    io::Read,
    process::{Child, ChildStdout, Command, Stdio},
    sync::Arc,
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use tracing::{debug, info, warn};

use crate::{
    source::{FrameSource, SourceStats},
    types::{CaptureError, Frame, FrameBundle, Modality, PixelFormat},
};

const READER_QUEUE: usize = 2;

/// Settings for [`FfmpegSource`].
#[derive(Clone, Debug)]
pub struct FfmpegSourceConfig {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    pub fps: Option<u32>,
    pub binary: String,
    pub modalities: Vec<Modality>,
}

struct Reader {
    child: Child,
    rx: Receiver<Result<Frame, CaptureError>>,
    thread: thread::JoinHandle<()>,
}

/// Colour-only [`FrameSource`] decoding a device or stream through ffmpeg.
pub struct FfmpegSource {
    config: FfmpegSourceConfig,
    command: Option<Command>,
    reader: Option<Reader>,
    sequence: u64,
    stats: Arc<SourceStats>,
}

impl FfmpegSource {
    pub fn new(config: FfmpegSourceConfig) -> Self {
        Self {
            config,
            command: None,
            reader: None,
            sequence: 0,
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        self.stats.clone()
    }

    fn frame_bytes(&self) -> usize {
        self.config.width as usize
            * self.config.height as usize
            * PixelFormat::Bgr8.bytes_per_pixel()
    }
}

impl FrameSource for FfmpegSource {
    fn setup(&mut self) -> Result<(), CaptureError> {
        if let Some(unsupported) = self
            .config
            .modalities
            .iter()
            .find(|m| **m != Modality::Color)
        {
            return Err(CaptureError::UnsupportedModality(*unsupported));
        }
        if self.config.width == 0 || self.config.height == 0 {
            return Err(CaptureError::Other(anyhow!(
                "capture size must be non-zero, got {}x{}",
                self.config.width,
                self.config.height
            )));
        }

        let command = build_capture_command(&self.config);
        debug!("Capture command: {command:?}");
        self.command = Some(command);
        info!(
            "Capture source {} prepared at {}x{}",
            self.config.uri, self.config.width, self.config.height
        );
        Ok(())
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        let mut command = self.command.take().ok_or(CaptureError::NotSetUp)?;
        let mut child = command.spawn().map_err(|err| {
            warn!("Failed to spawn {}: {err}", self.config.binary);
            CaptureError::Open {
                uri: self.config.uri.clone(),
            }
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

        let (tx, rx) = bounded(READER_QUEUE);
        let size = (self.config.width, self.config.height);
        let frame_bytes = self.frame_bytes();
        let thread = thread::Builder::new()
            .name("capture-reader".into())
            .spawn(move || {
                if let Err(err) = reader_loop(stdout, size, frame_bytes, &tx) {
                    let _ = tx.send(Err(err));
                }
            })
            .map_err(|err| CaptureError::Other(err.into()))?;

        self.reader = Some(Reader { child, rx, thread });
        Ok(())
    }

    fn acquire(&mut self, block: bool) -> Result<FrameBundle, CaptureError> {
        let reader = self.reader.as_ref().ok_or(CaptureError::NotRunning)?;
        let frame = if block {
            reader.rx.recv().map_err(|_| CaptureError::Closed)??
        } else {
            match reader.rx.try_recv() {
                Ok(frame) => frame?,
                Err(TryRecvError::Empty) => return Ok(FrameBundle::default()),
                Err(TryRecvError::Disconnected) => return Err(CaptureError::Closed),
            }
        };

        self.sequence = self.sequence.wrapping_add(1);
        let mut bundle = FrameBundle::new(self.sequence, frame.timestamp_ms);
        bundle.insert(frame.with_sequence(self.sequence));
        self.stats.record_acquire();
        Ok(bundle)
    }

    fn release(&mut self, bundle: FrameBundle) {
        if !bundle.is_empty() {
            self.stats.record_release();
        }
    }

    fn stop(&mut self) {
        let Some(Reader {
            mut child,
            rx,
            thread,
        }) = self.reader.take()
        else {
            return;
        };
        // Unblocks a reader parked on a full channel.
        drop(rx);
        let _ = child.kill();
        let _ = child.wait();
        if thread.join().is_err() {
            warn!("Capture reader thread panicked");
        }
        info!("Capture source {} stopped", self.config.uri);
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<u32>().ok();
        }
    }
    None
}

pub(crate) fn build_capture_command(config: &FfmpegSourceConfig) -> Command {
    let scale_arg = format!("scale={}:{}", config.width, config.height);
    let device = parse_device_index(&config.uri).map(|index| format!("/dev/video{index}"));

    let mut cmd = Command::new(&config.binary);
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    if device.is_some() {
        cmd.arg("-f").arg("video4linux2");
        cmd.arg("-video_size")
            .arg(format!("{}x{}", config.width, config.height));
        if let Some(fps) = config.fps {
            cmd.arg("-framerate").arg(fps.to_string());
        }
    }

    cmd.arg("-i")
        .arg(device.as_deref().unwrap_or(config.uri.as_str()))
        .arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    cmd
}

fn reader_loop(
    mut stdout: ChildStdout,
    size: (u32, u32),
    frame_bytes: usize,
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut buffer = vec![0u8; frame_bytes];
    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let frame = Frame::new(
                    Modality::Color,
                    size.0,
                    size.1,
                    PixelFormat::Bgr8,
                    buffer.clone(),
                )?
                .with_timestamp(Utc::now().timestamp_millis());
                if tx.send(Ok(frame)).is_err() {
                    return Ok(());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(CaptureError::Closed);
            }
            Err(err) => return Err(CaptureError::Other(err.into())),
        }
    }
}
