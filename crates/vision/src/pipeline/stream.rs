//! Raw frame hand-off to an external encoder process.
//!
//! The sink launches the encoder lazily on the first usable frame, once the
//! frame geometry and pixel format are known, then pipes every frame's bytes to
//! the encoder's stdin. Any write failure ends the sink for good.

use std::{
    io::{self, Write},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use video_ingest::{Frame, FrameBundle, PixelFormat};

use crate::pipeline::{
    config::{EncoderSettings, OutputConfig, OutputMode},
    processor::FrameProcessor,
};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{0:?} frames cannot be encoded without a pixel conversion")]
    UnsupportedFormat(PixelFormat),
    #[error("failed to launch encoder {binary}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
    #[error("encoder stdin unavailable")]
    MissingStdin,
    #[error("encoder accepted {written} of {expected} bytes")]
    Stalled { written: usize, expected: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// ffmpeg's name for a raw pixel layout.
///
/// ffmpeg's packed 32-bit names describe a native-endian word, so on little-endian
/// hosts byte order `R G B X` is `bgr32` and `B G R X` is `rgb32`.
pub fn pixel_format_token(format: PixelFormat) -> Option<&'static str> {
    match format {
        PixelFormat::Bgr8 => Some("bgr24"),
        PixelFormat::Rgb8 => Some("rgb24"),
        PixelFormat::Rgbx8 => Some("bgr32"),
        PixelFormat::Bgrx8 => Some("rgb32"),
        PixelFormat::Gray8 => Some("gray"),
        PixelFormat::Gray16Le => Some("gray16le"),
        PixelFormat::Float32 => None,
    }
}

/// Everything needed to start an encoder for one output stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderSpec {
    pub width: u32,
    pub height: u32,
    pub pixel_format: &'static str,
    pub mode: OutputMode,
    pub destination: String,
    pub frame_limit: Option<u64>,
    pub settings: EncoderSettings,
}

impl EncoderSpec {
    /// Encoder arguments, without the binary itself.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if self.mode == OutputMode::Sequence {
            args.push("-y".into());
        }
        args.extend([
            "-f".into(),
            "rawvideo".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-pix_fmt".into(),
            self.pixel_format.into(),
            "-i".into(),
            "-".into(),
        ]);

        match self.mode {
            OutputMode::Stream => args.extend([
                "-sdp_file".into(),
                self.settings.sdp_file.display().to_string(),
                "-vcodec".into(),
                self.settings.codec.clone(),
                "-f".into(),
                "rtp".into(),
                format!("rtp://{}", self.destination),
            ]),
            OutputMode::Sequence => {
                args.extend(["-f".into(), "image2".into()]);
                if let Some(limit) = self.frame_limit {
                    args.extend(["-vframes".into(), limit.to_string()]);
                }
                args.extend(["-vcodec".into(), "png".into(), self.destination.clone()]);
            }
        }
        args
    }

    pub fn command_line(&self) -> String {
        let mut line = self.settings.binary.clone();
        for arg in self.args() {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }
}

/// How long a closed encoder gets to flush its output before it is killed.
const ENCODER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const ENCODER_EXIT_POLL: Duration = Duration::from_millis(10);

/// Starts the encoder behind a [`StreamSink`].
pub trait EncoderLauncher {
    fn launch(&mut self, spec: &EncoderSpec) -> Result<Box<dyn Write + Send>, SinkError>;
}

/// Launches ffmpeg (or a compatible binary) as a child process.
#[derive(Debug, Default)]
pub struct FfmpegLauncher;

impl EncoderLauncher for FfmpegLauncher {
    fn launch(&mut self, spec: &EncoderSpec) -> Result<Box<dyn Write + Send>, SinkError> {
        let mut child = Command::new(&spec.settings.binary)
            .args(spec.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SinkError::Spawn {
                binary: spec.settings.binary.clone(),
                source,
            })?;
        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SinkError::MissingStdin);
        };
        Ok(Box::new(EncoderPipe::new(stdin, child, ENCODER_EXIT_TIMEOUT)))
    }
}

/// Write end of an encoder child. Dropping it closes stdin and waits up to
/// `exit_timeout` for the encoder to finish, killing it after that.
struct EncoderPipe {
    stdin: Option<ChildStdin>,
    child: Child,
    exit_timeout: Duration,
}

impl EncoderPipe {
    fn new(stdin: ChildStdin, child: Child, exit_timeout: Duration) -> Self {
        Self {
            stdin: Some(stdin),
            child,
            exit_timeout,
        }
    }
}

/// Poll `child` until it exits or `timeout` elapses. `Ok(None)` means it is
/// still running.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(ENCODER_EXIT_POLL);
    }
}

impl Write for EncoderPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for EncoderPipe {
    fn drop(&mut self) {
        drop(self.stdin.take());
        match wait_with_timeout(&mut self.child, self.exit_timeout) {
            Ok(Some(status)) if status.success() => debug!("Encoder exited cleanly"),
            Ok(Some(status)) => warn!("Encoder exited with {status}"),
            Ok(None) => {
                warn!(
                    "Encoder still running {:?} after its input closed, killing it",
                    self.exit_timeout
                );
                if let Err(err) = self.child.kill() {
                    warn!("Failed to kill encoder: {err}");
                }
                let _ = self.child.wait();
            }
            Err(err) => warn!("Failed to wait for encoder: {err}"),
        }
    }
}

/// Write every byte of `data`, retrying short writes while progress is made.
pub(crate) fn write_all_progress(writer: &mut dyn Write, data: &[u8]) -> Result<(), SinkError> {
    let mut written = 0;
    while written < data.len() {
        match writer.write(&data[written..]) {
            Ok(0) => {
                return Err(SinkError::Stalled {
                    written,
                    expected: data.len(),
                });
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// [`FrameProcessor`] that pipes one modality into an encoder.
pub struct StreamSink {
    config: OutputConfig,
    launcher: Box<dyn EncoderLauncher>,
    pipe: Option<Box<dyn Write + Send>>,
    geometry: Option<(u32, u32, PixelFormat)>,
    launched: bool,
    done: bool,
    frames_written: u64,
    bytes_written: u64,
}

impl StreamSink {
    pub fn new(config: OutputConfig) -> Self {
        Self::with_launcher(config, Box::new(FfmpegLauncher))
    }

    pub fn with_launcher(config: OutputConfig, launcher: Box<dyn EncoderLauncher>) -> Self {
        Self {
            config,
            launcher,
            pipe: None,
            geometry: None,
            launched: false,
            done: false,
            frames_written: 0,
            bytes_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn output_frame<'a>(&self, bundle: &'a FrameBundle) -> Option<&'a Frame> {
        let modality = self.config.modality;
        if !bundle.contains_all(modality.components()) {
            return None;
        }
        // Registration is not performed; registered outputs carry the primary frame.
        bundle
            .get(modality)
            .or_else(|| bundle.get(modality.primary()))
    }

    fn launch(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let pixel_format = pixel_format_token(frame.format())
            .ok_or(SinkError::UnsupportedFormat(frame.format()))?;
        let spec = EncoderSpec {
            width: frame.width(),
            height: frame.height(),
            pixel_format,
            mode: self.config.mode,
            destination: self.config.destination.clone(),
            frame_limit: self.config.frame_limit,
            settings: self.config.encoder.clone(),
        };
        info!("Running: {}", spec.command_line());
        self.pipe = Some(self.launcher.launch(&spec)?);
        self.geometry = Some((frame.width(), frame.height(), frame.format()));
        Ok(())
    }

    fn finish(&mut self, reason: &str) {
        self.done = true;
        info!("{reason}, won't process more frames");
    }
}

impl FrameProcessor for StreamSink {
    fn process_frame(&mut self, bundle: &mut FrameBundle) {
        if self.done {
            return;
        }
        let Some(frame) = self.output_frame(bundle) else {
            return;
        };

        if !self.launched {
            self.launched = true;
            if let Err(err) = self.launch(frame) {
                error!("Failed to set up output encoder: {err}");
                self.finish("Encoder unavailable");
                return;
            }
        }

        let geometry = (frame.width(), frame.height(), frame.format());
        if self.geometry != Some(geometry) {
            warn!(
                "Skipping {}x{} {:?} frame, encoder expects {:?}",
                geometry.0, geometry.1, geometry.2, self.geometry
            );
            return;
        }

        let Some(pipe) = self.pipe.as_mut() else {
            return;
        };
        match write_all_progress(pipe.as_mut(), frame.data()) {
            Ok(()) => {
                self.frames_written += 1;
                self.bytes_written += frame.byte_len() as u64;
                metrics::counter!("vision_encoder_bytes_written_total")
                    .increment(frame.byte_len() as u64);
            }
            Err(err) => {
                error!("Failed to output the frame: {err}");
                self.pipe = None;
                self.finish("Encoder pipe broken");
                return;
            }
        }

        if self
            .config
            .frame_limit
            .is_some_and(|limit| self.frames_written >= limit)
        {
            self.finish("Reached required number of frames");
        }
    }

    fn finished_with_frame(&self) -> bool {
        true
    }

    fn finished_processing(&self) -> bool {
        self.done
    }

    fn name(&self) -> &'static str {
        "stream-sink"
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            if let Err(err) = pipe.flush() {
                debug!("Encoder flush failed: {err}");
            }
        }
    }
}

/// Summary such as `color video to 10.0.0.2:8044`.
pub(crate) fn describe(config: &OutputConfig) -> String {
    let kind = match config.mode {
        OutputMode::Stream => "video",
        OutputMode::Sequence => "PNGs",
    };
    format!("{} {kind} to {}", config.modality, config.destination)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use video_ingest::Modality;

    use super::*;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            // accept at most 7 bytes per call to exercise short writes
            let n = buf.len().min(7);
            self.0.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Recording {
        sink: Shared,
        specs: Arc<Mutex<Vec<EncoderSpec>>>,
    }

    impl EncoderLauncher for Recording {
        fn launch(&mut self, spec: &EncoderSpec) -> Result<Box<dyn Write + Send>, SinkError> {
            self.specs.lock().unwrap().push(spec.clone());
            Ok(Box::new(self.sink.clone()))
        }
    }

    struct Stalling;

    impl Write for Stalling {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct StallingLauncher;

    impl EncoderLauncher for StallingLauncher {
        fn launch(&mut self, _spec: &EncoderSpec) -> Result<Box<dyn Write + Send>, SinkError> {
            Ok(Box::new(Stalling))
        }
    }

    fn output(modality: Modality, mode: OutputMode, limit: Option<u64>) -> OutputConfig {
        OutputConfig {
            modality,
            mode,
            destination: "10.0.0.2:8044".into(),
            frame_limit: limit,
            encoder: EncoderSettings::default(),
        }
    }

    fn bundle_with(frames: Vec<Frame>) -> FrameBundle {
        let mut bundle = FrameBundle::new(1, 0);
        for frame in frames {
            bundle.insert(frame);
        }
        bundle
    }

    fn color(width: u32, height: u32) -> Frame {
        let data = (0..width * height * 4).map(|v| v as u8).collect();
        Frame::new(Modality::Color, width, height, PixelFormat::Bgrx8, data).unwrap()
    }

    fn depth(width: u32, height: u32) -> Frame {
        let data = vec![0; (width * height * 4) as usize];
        Frame::new(Modality::Depth, width, height, PixelFormat::Float32, data).unwrap()
    }

    #[test]
    fn stream_command_line() {
        let spec = EncoderSpec {
            width: 1920,
            height: 1080,
            pixel_format: "rgb32",
            mode: OutputMode::Stream,
            destination: "192.168.1.157:8044".into(),
            frame_limit: None,
            settings: EncoderSettings::default(),
        };
        assert_eq!(
            spec.command_line(),
            "ffmpeg -f rawvideo -s 1920x1080 -pix_fmt rgb32 -i - -sdp_file saved_sdp_file \
             -vcodec h264_nvmpi -f rtp rtp://192.168.1.157:8044"
        );
    }

    #[test]
    fn sequence_command_line() {
        let spec = EncoderSpec {
            width: 512,
            height: 424,
            pixel_format: "gray",
            mode: OutputMode::Sequence,
            destination: "out/frame_%04d.png".into(),
            frame_limit: Some(10),
            settings: EncoderSettings::default(),
        };
        assert_eq!(
            spec.args().join(" "),
            "-y -f rawvideo -s 512x424 -pix_fmt gray -i - -f image2 -vframes 10 \
             -vcodec png out/frame_%04d.png"
        );
    }

    #[test]
    fn pixel_tokens() {
        assert_eq!(pixel_format_token(PixelFormat::Rgbx8), Some("bgr32"));
        assert_eq!(pixel_format_token(PixelFormat::Bgrx8), Some("rgb32"));
        assert_eq!(pixel_format_token(PixelFormat::Gray8), Some("gray"));
        assert_eq!(pixel_format_token(PixelFormat::Float32), None);
    }

    #[test]
    fn writes_whole_frames_and_stops_at_limit() {
        let sink_buf = Shared::default();
        let specs = Arc::new(Mutex::new(Vec::new()));
        let launcher = Recording {
            sink: sink_buf.clone(),
            specs: specs.clone(),
        };
        let mut sink = StreamSink::with_launcher(
            output(Modality::Color, OutputMode::Stream, Some(2)),
            Box::new(launcher),
        );

        for _ in 0..3 {
            let mut bundle = bundle_with(vec![color(4, 3)]);
            sink.process_frame(&mut bundle);
        }

        assert_eq!(sink.frames_written(), 2);
        assert_eq!(sink_buf.0.lock().unwrap().len(), 2 * 4 * 3 * 4);
        assert!(sink.finished_processing());
        assert!(sink.finished_with_frame());

        let specs = specs.lock().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].pixel_format, "rgb32");
        assert_eq!((specs[0].width, specs[0].height), (4, 3));
    }

    #[test]
    fn bundles_missing_components_are_skipped() {
        let sink_buf = Shared::default();
        let launcher = Recording {
            sink: sink_buf.clone(),
            specs: Arc::default(),
        };
        let mut sink = StreamSink::with_launcher(
            output(Modality::ColorDepthRegistered, OutputMode::Stream, None),
            Box::new(launcher),
        );

        sink.process_frame(&mut bundle_with(vec![color(2, 2)]));
        assert_eq!(sink.frames_written(), 0);

        sink.process_frame(&mut bundle_with(vec![color(2, 2), depth(2, 2)]));
        assert_eq!(sink.frames_written(), 1);
        // registered colour output carries the colour frame
        assert_eq!(sink_buf.0.lock().unwrap().len(), 2 * 2 * 4);
    }

    #[test]
    fn float_output_gives_up() {
        let mut sink = StreamSink::with_launcher(
            output(Modality::Depth, OutputMode::Sequence, None),
            Box::new(StallingLauncher),
        );
        sink.process_frame(&mut bundle_with(vec![depth(2, 2)]));
        assert!(sink.finished_processing());
        assert_eq!(sink.frames_written(), 0);
    }

    #[test]
    fn zero_progress_write_is_terminal() {
        let mut sink = StreamSink::with_launcher(
            output(Modality::Color, OutputMode::Stream, None),
            Box::new(StallingLauncher),
        );
        sink.process_frame(&mut bundle_with(vec![color(2, 2)]));
        assert!(sink.finished_processing());
        assert_eq!(sink.bytes_written(), 0);
    }

    #[cfg(unix)]
    fn piped(program: &str, args: &[&str]) -> (ChildStdin, Child) {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        (stdin, child)
    }

    #[cfg(unix)]
    #[test]
    fn encoder_that_ignores_eof_is_killed() {
        let (stdin, child) = piped("sleep", &["30"]);
        let pipe = EncoderPipe::new(stdin, child, Duration::from_millis(100));

        let started = Instant::now();
        drop(pipe);

        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn encoder_exiting_on_eof_is_reaped() {
        let (stdin, child) = piped("cat", &[]);
        let mut pipe = EncoderPipe::new(stdin, child, ENCODER_EXIT_TIMEOUT);
        pipe.write_all(b"frame").unwrap();

        drop(pipe.stdin.take());
        let status = wait_with_timeout(&mut pipe.child, ENCODER_EXIT_TIMEOUT).unwrap();

        assert!(status.is_some_and(|status| status.success()));
    }

    #[test]
    fn describe_mentions_mode() {
        let cfg = output(Modality::Color, OutputMode::Sequence, None);
        assert_eq!(describe(&cfg), "color PNGs to 10.0.0.2:8044");
    }
}
