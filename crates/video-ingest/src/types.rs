use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
};

use thiserror::Error;

/// Kind of camera output carried by a [`Frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modality {
    Color,
    Depth,
    Infrared,
    /// Colour frame registered onto the depth frame.
    ColorDepthRegistered,
    /// Depth frame registered onto the colour frame.
    DepthColorRegistered,
}

impl Modality {
    /// Raw modalities that must be present in a bundle before this one can be used.
    pub fn components(self) -> &'static [Modality] {
        match self {
            Modality::Color => &[Modality::Color],
            Modality::Depth => &[Modality::Depth],
            Modality::Infrared => &[Modality::Infrared],
            Modality::ColorDepthRegistered | Modality::DepthColorRegistered => {
                &[Modality::Color, Modality::Depth]
            }
        }
    }

    /// Raw modality whose pixels make up this modality's output frame.
    pub fn primary(self) -> Modality {
        match self {
            Modality::Color | Modality::ColorDepthRegistered => Modality::Color,
            Modality::Depth | Modality::DepthColorRegistered => Modality::Depth,
            Modality::Infrared => Modality::Infrared,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Modality::Color => "color",
            Modality::Depth => "depth",
            Modality::Infrared => "ir",
            Modality::ColorDepthRegistered => "color-depth",
            Modality::DepthColorRegistered => "depth-color",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Modality {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "color" | "colour" | "rgb" => Ok(Modality::Color),
            "depth" => Ok(Modality::Depth),
            "ir" | "infrared" => Ok(Modality::Infrared),
            "color-depth" | "rgb-depth" => Ok(Modality::ColorDepthRegistered),
            "depth-color" | "depth-rgb" => Ok(Modality::DepthColorRegistered),
            other => Err(CaptureError::UnknownModality(other.to_string())),
        }
    }
}

/// Pixel encoding of a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
    /// Four bytes per pixel, B G R then an unused byte.
    Bgrx8,
    /// Four bytes per pixel, R G B then an unused byte.
    Rgbx8,
    Gray8,
    Gray16Le,
    /// Single 32-bit float per pixel (depth in millimetres, raw IR).
    Float32,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Bgrx8 | PixelFormat::Rgbx8 => 4,
            PixelFormat::Gray8 | PixelFormat::Gray16Le | PixelFormat::Float32 => 1,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Bgrx8 | PixelFormat::Rgbx8 | PixelFormat::Float32 => 4,
            PixelFormat::Gray8 => 1,
            PixelFormat::Gray16Le => 2,
        }
    }

    /// True for formats whose channels are plain 8-bit samples.
    pub fn is_8bit(self) -> bool {
        !matches!(self, PixelFormat::Gray16Le | PixelFormat::Float32)
    }
}

/// Owned pixel buffer captured at one instant.
///
/// Data is row-major without padding; the constructor enforces
/// `data.len() == width * height * bytes_per_pixel`.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    modality: Modality,
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    pub timestamp_ms: i64,
    pub sequence: u64,
}

impl Frame {
    pub fn new(
        modality: Modality,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, CaptureError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(CaptureError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            modality,
            width,
            height,
            format,
            data,
            timestamp_ms: 0,
            sequence: 0,
        })
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy out a sub-rectangle, clamped to the frame bounds.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Frame {
        let x = x.min(self.width);
        let y = y.min(self.height);
        let width = width.min(self.width - x);
        let height = height.min(self.height - y);
        let bpp = self.bytes_per_pixel();
        let stride = self.width as usize * bpp;
        let row_bytes = width as usize * bpp;

        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in y..y + height {
            let start = row as usize * stride + x as usize * bpp;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }

        Frame {
            modality: self.modality,
            width,
            height,
            format: self.format,
            data,
            timestamp_ms: self.timestamp_ms,
            sequence: self.sequence,
        }
    }

    /// Copy of the `side`×`side` square centred in the frame (smaller when the frame is).
    pub fn center_square(&self, side: u32) -> Frame {
        let width = side.min(self.width);
        let height = side.min(self.height);
        let x = (self.width - width) / 2;
        let y = (self.height - height) / 2;
        self.crop(x, y, width, height)
    }
}

/// Every frame captured at one instant, keyed by modality.
#[derive(Clone, Debug, Default)]
pub struct FrameBundle {
    frames: HashMap<Modality, Frame>,
    pub sequence: u64,
    pub timestamp_ms: i64,
}

impl FrameBundle {
    pub fn new(sequence: u64, timestamp_ms: i64) -> Self {
        Self {
            frames: HashMap::new(),
            sequence,
            timestamp_ms,
        }
    }

    /// Insert a frame under its own modality, returning any frame it replaced.
    pub fn insert(&mut self, frame: Frame) -> Option<Frame> {
        self.frames.insert(frame.modality(), frame)
    }

    pub fn get(&self, modality: Modality) -> Option<&Frame> {
        self.frames.get(&modality)
    }

    pub fn contains(&self, modality: Modality) -> bool {
        self.frames.contains_key(&modality)
    }

    pub fn contains_all(&self, modalities: &[Modality]) -> bool {
        modalities.iter().all(|m| self.contains(*m))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("no capture device detected")]
    NoDevice,
    #[error("capture source has not been set up")]
    NotSetUp,
    #[error("capture source is not running")]
    NotRunning,
    #[error("capture source cannot produce {0} frames")]
    UnsupportedModality(Modality),
    #[error("unknown modality {0:?}")]
    UnknownModality(String),
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("capture stream ended")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
