use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

use ml_core::{BackendInfo, InferenceBackend, InferenceError, InputBlob, OutputLayerKind, OutputTensor};
use video_ingest::{FrameSource, Modality, SyntheticConfig, SyntheticSource};
use vision::pipeline::{
    DetectionEngine, DetectorConfig, EncoderLauncher, EncoderSettings, EncoderSpec,
    FrameProcessor, OutputConfig, OutputMode, PipelineConfig, PipelineDriver, PipelineState,
    ShutdownToken, SinkError, StreamSink,
};

#[derive(Clone, Default)]
struct Captured {
    bytes: Arc<Mutex<Vec<u8>>>,
    specs: Arc<Mutex<Vec<EncoderSpec>>>,
}

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MemoryLauncher(Captured);

impl EncoderLauncher for MemoryLauncher {
    fn launch(&mut self, spec: &EncoderSpec) -> Result<Box<dyn Write + Send>, SinkError> {
        self.0.specs.lock().unwrap().push(spec.clone());
        Ok(Box::new(SharedWriter(self.0.bytes.clone())))
    }
}

struct FailingLauncher {
    attempts: Arc<Mutex<u32>>,
}

impl EncoderLauncher for FailingLauncher {
    fn launch(&mut self, spec: &EncoderSpec) -> Result<Box<dyn Write + Send>, SinkError> {
        *self.attempts.lock().unwrap() += 1;
        Err(SinkError::Spawn {
            binary: spec.settings.binary.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such binary"),
        })
    }
}

struct FixedBackend {
    info: BackendInfo,
}

impl InferenceBackend for FixedBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn forward(&mut self, _input: &InputBlob) -> Result<Vec<OutputTensor>, InferenceError> {
        Ok(vec![OutputTensor::flat(vec![
            0.0, 1.0, 0.95, 0.25, 0.25, 0.75, 0.75,
        ])])
    }
}

fn synthetic(width: u32, height: u32, modalities: Vec<Modality>) -> Box<dyn FrameSource> {
    let mut source = SyntheticSource::new(SyntheticConfig {
        width,
        height,
        modalities,
        fps: None,
        max_frames: None,
    });
    source.setup().unwrap();
    source.start().unwrap();
    Box::new(source)
}

fn output(modality: Modality, frame_limit: Option<u64>) -> OutputConfig {
    OutputConfig {
        modality,
        mode: OutputMode::Stream,
        destination: "127.0.0.1:9000".into(),
        frame_limit,
        encoder: EncoderSettings::default(),
    }
}

#[test]
fn frame_limit_bounds_acquire_release_cycles() {
    let captured = Captured::default();
    let sink = StreamSink::with_launcher(
        output(Modality::Color, None),
        Box::new(MemoryLauncher(captured.clone())),
    );
    let processors: Vec<Box<dyn FrameProcessor>> = vec![Box::new(sink)];
    let mut driver = PipelineDriver::new(
        synthetic(16, 8, vec![Modality::Color]),
        processors,
        ShutdownToken::new(),
        Some(5),
    );

    let summary = driver.run().unwrap();

    assert_eq!(summary.frames, 5);
    assert_eq!(driver.state(), PipelineState::Stopped);
    assert_eq!(captured.bytes.lock().unwrap().len(), 5 * 16 * 8 * 3);
    let specs = captured.specs.lock().unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].pixel_format, "bgr24");
}

#[test]
fn encoder_launch_failure_stops_after_first_frame() {
    let attempts = Arc::new(Mutex::new(0));
    let sink = StreamSink::with_launcher(
        output(Modality::Color, None),
        Box::new(FailingLauncher {
            attempts: attempts.clone(),
        }),
    );
    let processors: Vec<Box<dyn FrameProcessor>> = vec![Box::new(sink)];
    let mut driver = PipelineDriver::new(
        synthetic(16, 8, vec![Modality::Color]),
        processors,
        ShutdownToken::new(),
        None,
    );

    let summary = driver.run().unwrap();

    assert_eq!(summary.frames, 1);
    assert_eq!(*attempts.lock().unwrap(), 1);
}

#[test]
fn sink_frame_limit_ends_the_run() {
    let captured = Captured::default();
    let sink = StreamSink::with_launcher(
        output(Modality::Infrared, Some(3)),
        Box::new(MemoryLauncher(captured.clone())),
    );
    let processors: Vec<Box<dyn FrameProcessor>> = vec![Box::new(sink)];
    let mut driver = PipelineDriver::new(
        synthetic(8, 8, vec![Modality::Color, Modality::Infrared]),
        processors,
        ShutdownToken::new(),
        Some(100),
    );

    let summary = driver.run().unwrap();

    assert_eq!(summary.frames, 3);
    assert_eq!(captured.bytes.lock().unwrap().len(), 3 * 8 * 8);
    assert_eq!(captured.specs.lock().unwrap()[0].pixel_format, "gray");
}

#[test]
fn detection_crops_frames_before_streaming() {
    let captured = Captured::default();
    let detector = DetectorConfig {
        input_size: 16,
        ..Default::default()
    };
    let engine = DetectionEngine::with_backend(
        &detector,
        Some(Box::new(FixedBackend {
            info: BackendInfo::single(OutputLayerKind::FixedRecord),
        })),
        None,
    );
    assert!(engine.has_backend());
    let sink = StreamSink::with_launcher(
        output(Modality::Color, None),
        Box::new(MemoryLauncher(captured.clone())),
    );
    let processors: Vec<Box<dyn FrameProcessor>> = vec![Box::new(engine), Box::new(sink)];
    let mut driver = PipelineDriver::new(
        synthetic(32, 24, vec![Modality::Color]),
        processors,
        ShutdownToken::new(),
        Some(10),
    );

    let summary = driver.run().unwrap();

    assert_eq!(summary.frames, 10);
    assert_eq!(captured.bytes.lock().unwrap().len(), 10 * 16 * 16 * 3);
    let specs = captured.specs.lock().unwrap();
    assert_eq!((specs[0].width, specs[0].height), (16, 16));
}

#[test]
fn shutdown_before_run_reads_one_frame() {
    let shutdown = ShutdownToken::new();
    shutdown.trigger();
    let mut driver = PipelineDriver::new(
        synthetic(4, 4, vec![Modality::Color]),
        Vec::new(),
        shutdown,
        None,
    );
    assert_eq!(driver.run().unwrap().frames, 1);
}

#[test]
fn closed_source_is_reported() {
    let mut source = SyntheticSource::new(SyntheticConfig {
        width: 4,
        height: 4,
        modalities: vec![Modality::Color],
        fps: None,
        max_frames: Some(2),
    });
    source.setup().unwrap();
    source.start().unwrap();
    let mut driver = PipelineDriver::new(Box::new(source), Vec::new(), ShutdownToken::new(), None);

    let err = driver.run().unwrap_err();

    assert!(format!("{err:#}").contains("capture stream ended"));
    assert_eq!(driver.frames(), 2);
    assert_eq!(driver.state(), PipelineState::Stopped);
}

#[test]
fn run_rejects_invalid_configuration() {
    let config = PipelineConfig {
        width: 0,
        ..Default::default()
    };
    assert!(vision::pipeline::run(config).is_err());
}

#[test]
fn run_streams_synthetic_frames_until_limit() {
    let config = PipelineConfig {
        width: 8,
        height: 8,
        frame_limit: Some(4),
        ..Default::default()
    };
    let summary = vision::pipeline::run(config).unwrap();
    assert_eq!(summary.frames, 4);
}
