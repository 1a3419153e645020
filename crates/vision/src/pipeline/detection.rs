//! Asynchronous object detection on a subsampled frame stream.
//!
//! The capture side offers frames through a single slot; the detection worker
//! picks up whatever frame occupies it, runs the network and appends results to
//! a queue the capture side drains. Offers made while the slot is busy are
//! dropped, so capture never waits on inference.

use std::{
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use ml_core::{
    BackendInfo, ClassNames, Detection, InferenceBackend, PixelLayout, PostprocessConfig,
    postprocess, preprocess,
};
use tracing::{debug, error, info, warn};
use video_ingest::{Frame, FrameBundle, Modality, PixelFormat};

use crate::pipeline::{
    annotation::annotate_frame, config::DetectorConfig, processor::FrameProcessor, telemetry,
};

/// Per-run settings used by the worker and the overlay pass.
#[derive(Clone, Debug)]
struct DetectionSettings {
    input_size: u32,
    scale: f32,
    postprocess: PostprocessConfig,
}

impl From<&DetectorConfig> for DetectionSettings {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            input_size: config.input_size,
            scale: config.scale,
            postprocess: config.postprocess(),
        }
    }
}

struct Shared {
    slot: Mutex<Option<Frame>>,
    slot_ready: Condvar,
    detections: Mutex<Vec<Detection>>,
    running: AtomicBool,
}

/// [`FrameProcessor`] that overlays the latest detections on the colour frame.
pub struct DetectionEngine {
    shared: Arc<Shared>,
    settings: DetectionSettings,
    classes: Option<ClassNames>,
    working: Vec<Detection>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DetectionEngine {
    /// Build an engine from configuration. Load failures are logged and leave the
    /// engine without a backend: frames still pass through, no detections appear.
    pub fn new(config: &DetectorConfig) -> Self {
        let classes = config.classes.as_ref().and_then(|path| match ClassNames::load(path) {
            Ok(classes) => {
                info!("Read {} classes", classes.len());
                Some(classes)
            }
            Err(err) => {
                warn!("{err}, continuing");
                None
            }
        });
        Self::with_backend(config, load_backend(config), classes)
    }

    pub fn with_backend(
        config: &DetectorConfig,
        backend: Option<Box<dyn InferenceBackend>>,
        classes: Option<ClassNames>,
    ) -> Self {
        let settings = DetectionSettings::from(config);
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            slot_ready: Condvar::new(),
            detections: Mutex::new(Vec::new()),
            running: AtomicBool::new(backend.is_some()),
        });

        let worker = backend.and_then(|backend| {
            let worker_shared = shared.clone();
            let worker_settings = settings.clone();
            match telemetry::spawn_thread("detection-worker", move || {
                inference_loop(worker_shared, backend, worker_settings)
            }) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    error!("Failed to spawn detection worker: {err}");
                    shared.running.store(false, Ordering::SeqCst);
                    None
                }
            }
        });

        Self {
            shared,
            settings,
            classes,
            working: Vec::new(),
            worker,
        }
    }

    /// Whether a backend is attached and its worker is running.
    pub fn has_backend(&self) -> bool {
        self.worker.is_some()
    }

    /// Offer a copy of `frame` for inference. Returns `false` without blocking
    /// when a frame is already waiting or being processed.
    pub fn submit(&self, frame: &Frame) -> bool {
        let Ok(mut slot) = self.shared.slot.lock() else {
            return false;
        };
        if slot.is_some() {
            metrics::counter!("vision_detection_dropped_submissions_total").increment(1);
            return false;
        }
        *slot = Some(frame.clone());
        self.shared.slot_ready.notify_one();
        true
    }

    /// Take every detection produced since the previous call.
    pub fn drain_detections(&self) -> Vec<Detection> {
        match self.shared.detections.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(_) => Vec::new(),
        }
    }
}

impl FrameProcessor for DetectionEngine {
    fn process_frame(&mut self, bundle: &mut FrameBundle) {
        let Some(color) = bundle.get(Modality::Color) else {
            return;
        };
        let mut cropped = color.center_square(self.settings.input_size);

        // Results belong to the frame being inferred, so a fresh submission
        // invalidates what was drawn so far.
        if self.submit(&cropped) {
            self.working.clear();
        }
        let drained = self.drain_detections();
        self.working.extend(drained);

        if !annotate_frame(&mut cropped, &self.working, self.classes.as_ref()) {
            debug!("Skipping overlay on {:?} frame", cropped.format());
        }
        bundle.insert(cropped);
    }

    fn finished_with_frame(&self) -> bool {
        true
    }

    fn finished_processing(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "detection-engine"
    }
}

impl Drop for DetectionEngine {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        // Notify under the lock so the wakeup cannot slip between check and wait.
        if let Ok(_slot) = self.shared.slot.lock() {
            self.shared.slot_ready.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Detection worker panicked");
            }
        }
    }
}

fn inference_loop(
    shared: Arc<Shared>,
    mut backend: Box<dyn InferenceBackend>,
    settings: DetectionSettings,
) {
    let info = backend.info().clone();
    debug!("Detection worker started (layers: {:?})", info.layers);

    loop {
        let frame = {
            let Ok(mut slot) = shared.slot.lock() else {
                break;
            };
            while slot.is_none() && shared.running.load(Ordering::SeqCst) {
                slot = match shared.slot_ready.wait(slot) {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
            }
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            // Copy out; the slot stays occupied until inference completes.
            slot.clone()
        };
        let Some(frame) = frame else {
            continue;
        };

        let detections = detect(backend.as_mut(), &info, &frame, &settings);
        if !detections.is_empty() {
            metrics::counter!("vision_detections_total").increment(detections.len() as u64);
            if let Ok(mut queue) = shared.detections.lock() {
                queue.extend(detections);
            }
        }

        if let Ok(mut slot) = shared.slot.lock() {
            *slot = None;
        }
    }
    debug!("Detection worker stopped");
}

fn detect(
    backend: &mut dyn InferenceBackend,
    info: &BackendInfo,
    frame: &Frame,
    settings: &DetectionSettings,
) -> Vec<Detection> {
    let _span = tracing::info_span!(
        "detection.infer",
        frame = frame.sequence,
        width = frame.width(),
        height = frame.height()
    )
    .entered();

    let Some(layout) = pixel_layout(frame.format()) else {
        debug!("Cannot run detection on {:?} frames", frame.format());
        return Vec::new();
    };

    let started = Instant::now();
    let blob = match preprocess(
        frame.data(),
        frame.width(),
        frame.height(),
        layout,
        settings.input_size,
        settings.scale,
    ) {
        Ok(blob) => blob,
        Err(err) => {
            warn!("Preprocessing failed: {err}");
            return Vec::new();
        }
    };

    let outputs = match backend.forward(&blob) {
        Ok(outputs) => outputs,
        Err(err) => {
            error!("Inference failed: {err}");
            return Vec::new();
        }
    };
    metrics::histogram!("vision_inference_latency_seconds")
        .record(started.elapsed().as_secs_f64());

    postprocess(
        &outputs,
        info,
        (frame.width(), frame.height()),
        &settings.postprocess,
    )
}

fn pixel_layout(format: PixelFormat) -> Option<PixelLayout> {
    match format {
        PixelFormat::Bgr8 => Some(PixelLayout::Bgr),
        PixelFormat::Rgb8 => Some(PixelLayout::Rgb),
        PixelFormat::Bgrx8 => Some(PixelLayout::Bgrx),
        PixelFormat::Rgbx8 => Some(PixelLayout::Rgbx),
        PixelFormat::Gray8 => Some(PixelLayout::Gray),
        PixelFormat::Gray16Le | PixelFormat::Float32 => None,
    }
}

#[cfg(feature = "with-tch")]
fn load_backend(config: &DetectorConfig) -> Option<Box<dyn InferenceBackend>> {
    let model = config.model.as_ref()?;
    let layers = match config.output_layers() {
        Ok(layers) => layers,
        Err(err) => {
            error!("{err:#}");
            return None;
        }
    };
    info!("Reading in model ({}), output layers {layers:?}", model.display());
    match ml_core::TorchBackend::load(model, layers) {
        Ok(backend) => Some(Box::new(backend)),
        Err(err) => {
            error!("Hit error while trying to read in model: {err}");
            None
        }
    }
}

#[cfg(not(feature = "with-tch"))]
fn load_backend(config: &DetectorConfig) -> Option<Box<dyn InferenceBackend>> {
    if let Some(model) = &config.model {
        error!(
            "Cannot load model {}: built without the `with-tch` feature, detections disabled",
            model.display()
        );
    }
    None
}
