use video_ingest::FrameBundle;

/// Stage fed with every bundle the driver acquires.
///
/// Processors run on the driver thread in registration order. A processor that
/// needs the pixels past `process_frame` keeps its own copy; the bundle is handed
/// back to the source once every processor reports `finished_with_frame`.
pub trait FrameProcessor {
    /// Consume one bundle. May replace frames in place (e.g. with an annotated copy).
    fn process_frame(&mut self, bundle: &mut FrameBundle);

    /// True once the processor no longer reads from the last bundle.
    fn finished_with_frame(&self) -> bool;

    /// True once the processor wants no further frames.
    fn finished_processing(&self) -> bool;

    fn name(&self) -> &'static str;
}
