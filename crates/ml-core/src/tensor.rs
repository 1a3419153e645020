use image::{
    ImageBuffer, Rgb,
    imageops::{self, FilterType},
};

use crate::backend::InferenceError;

/// Channel order of an 8-bit host frame handed to [`preprocess`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Gray,
    Bgr,
    Rgb,
    Bgrx,
    Rgbx,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray => 1,
            PixelLayout::Bgr | PixelLayout::Rgb => 3,
            PixelLayout::Bgrx | PixelLayout::Rgbx => 4,
        }
    }

    fn rgb(self, px: &[u8]) -> [u8; 3] {
        match self {
            PixelLayout::Gray => [px[0], px[0], px[0]],
            PixelLayout::Bgr | PixelLayout::Bgrx => [px[2], px[1], px[0]],
            PixelLayout::Rgb | PixelLayout::Rgbx => [px[0], px[1], px[2]],
        }
    }
}

/// Dense `f32` network input in NCHW order.
#[derive(Clone, Debug, PartialEq)]
pub struct InputBlob {
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

impl InputBlob {
    pub fn side(&self) -> usize {
        self.shape[3]
    }
}

/// One output layer flattened to a `rows x cols` matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl OutputTensor {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        Self { rows, cols, data }
    }

    /// Row-vector view, used for flat record outputs.
    pub fn flat(data: Vec<f32>) -> Self {
        Self {
            rows: 1,
            cols: data.len(),
            data,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.rows * self.cols == self.data.len()
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        if index >= self.rows || !self.is_consistent() {
            return None;
        }
        let start = index * self.cols;
        Some(&self.data[start..start + self.cols])
    }
}

/// Resize a frame to `side x side`, reorder to RGB planes and scale every sample.
///
/// Single-channel frames are replicated across the three planes.
pub fn preprocess(
    pixels: &[u8],
    width: u32,
    height: u32,
    layout: PixelLayout,
    side: u32,
    scale: f32,
) -> Result<InputBlob, InferenceError> {
    let bpp = layout.bytes_per_pixel();
    let expected = width as usize * height as usize * bpp;
    if width == 0 || height == 0 || side == 0 {
        return Err(InferenceError::Input(format!(
            "cannot build a {side}x{side} blob from a {width}x{height} frame"
        )));
    }
    if pixels.len() != expected {
        return Err(InferenceError::Input(format!(
            "frame holds {} bytes, expected {expected}",
            pixels.len()
        )));
    }

    let rgb: Vec<u8> = pixels.chunks_exact(bpp).flat_map(|px| layout.rgb(px)).collect();
    let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(width, height, rgb)
        .ok_or_else(|| InferenceError::Input("frame buffer too small".into()))?;
    let image = if (width, height) == (side, side) {
        image
    } else {
        imageops::resize(&image, side, side, FilterType::Triangle)
    };

    let plane = side as usize * side as usize;
    let mut data = vec![0.0f32; plane * 3];
    for (index, pixel) in image.pixels().enumerate() {
        for (channel, value) in pixel.0.iter().enumerate() {
            data[channel * plane + index] = *value as f32 * scale;
        }
    }

    Ok(InputBlob {
        shape: [1, 3, side as usize, side as usize],
        data,
    })
}
