//! Detection overlay drawn straight into 8-bit frame buffers.

use std::ops::DerefMut;

use image::{ImageBuffer, Luma, Pixel, Rgb, Rgba};
use ml_core::{ClassNames, Detection};
use tracing::debug;
use video_ingest::Frame;

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = GLYPH_WIDTH + 1;
const LABEL_PADDING: i32 = 1;

struct Palette<P> {
    rect: P,
    label_background: P,
    label_text: P,
}

/// Label shown next to a detection: `"<class>: <conf>"`, or just the confidence
/// when the class id has no name.
pub fn label_text(detection: &Detection, classes: Option<&ClassNames>) -> String {
    let confidence = format!("{:.2}", detection.confidence);
    let Some(classes) = classes.filter(|c| !c.is_empty()) else {
        return confidence;
    };
    match classes.label(detection.class_id) {
        Some(name) => format!("{name}: {confidence}"),
        None => {
            debug!(
                "Class id {} outside the {} known classes",
                detection.class_id,
                classes.len()
            );
            confidence
        }
    }
}

/// Draw every detection onto `frame`. Returns `false` when the pixel format
/// cannot be drawn on (16-bit and float frames are left untouched).
pub fn annotate_frame(
    frame: &mut Frame,
    detections: &[Detection],
    classes: Option<&ClassNames>,
) -> bool {
    let (width, height) = (frame.width(), frame.height());
    let format = frame.format();
    if !format.is_8bit() {
        return false;
    }
    let data = frame.data_mut();

    match format.channels() {
        1 => ImageBuffer::<Luma<u8>, &mut [u8]>::from_raw(width, height, data)
            .map(|mut image| {
                let palette = Palette {
                    rect: Luma([255]),
                    label_background: Luma([255]),
                    label_text: Luma([0]),
                };
                draw_detections(&mut image, detections, classes, &palette)
            })
            .is_some(),
        3 => ImageBuffer::<Rgb<u8>, &mut [u8]>::from_raw(width, height, data)
            .map(|mut image| {
                let palette = Palette {
                    rect: Rgb([0, 255, 0]),
                    label_background: Rgb([255, 255, 255]),
                    label_text: Rgb([0, 0, 0]),
                };
                draw_detections(&mut image, detections, classes, &palette)
            })
            .is_some(),
        4 => ImageBuffer::<Rgba<u8>, &mut [u8]>::from_raw(width, height, data)
            .map(|mut image| {
                let palette = Palette {
                    rect: Rgba([0, 255, 0, 255]),
                    label_background: Rgba([255, 255, 255, 255]),
                    label_text: Rgba([0, 0, 0, 255]),
                };
                draw_detections(&mut image, detections, classes, &palette)
            })
            .is_some(),
        _ => false,
    }
}

fn draw_detections<P, C>(
    image: &mut ImageBuffer<P, C>,
    detections: &[Detection],
    classes: Option<&ClassNames>,
    palette: &Palette<P>,
) where
    P: Pixel,
    C: DerefMut<Target = [P::Subpixel]>,
{
    for detection in detections {
        let rect = detection.rect;
        draw_rectangle(image, rect.x, rect.y, rect.right(), rect.bottom(), palette.rect);

        let text = label_text(detection, classes);
        let label_height = GLYPH_HEIGHT + 2 * LABEL_PADDING;
        let text_width = text.chars().count() as i32 * GLYPH_ADVANCE;
        let top = rect.y.max(label_height);
        fill_rect(
            image,
            rect.x,
            top - label_height,
            rect.x.saturating_add(text_width),
            top,
            palette.label_background,
        );
        draw_label(
            image,
            rect.x.saturating_add(LABEL_PADDING),
            top - label_height + LABEL_PADDING,
            &text,
            palette.label_text,
        );
    }
}

fn draw_rectangle<P, C>(
    image: &mut ImageBuffer<P, C>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: P,
) where
    P: Pixel,
    C: DerefMut<Target = [P::Subpixel]>,
{
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 || right < 0 || bottom < 0 || left >= width || top >= height {
        return;
    }

    let x0 = left.clamp(0, width - 1);
    let x1 = right.clamp(0, width - 1);
    let y0 = top.clamp(0, height - 1);
    let y1 = bottom.clamp(0, height - 1);

    for x in x0..=x1 {
        if top >= 0 {
            image.put_pixel(x as u32, top as u32, color);
        }
        if bottom < height {
            image.put_pixel(x as u32, bottom as u32, color);
        }
    }
    for y in y0..=y1 {
        if left >= 0 {
            image.put_pixel(left as u32, y as u32, color);
        }
        if right < width {
            image.put_pixel(right as u32, y as u32, color);
        }
    }
}

fn fill_rect<P, C>(
    image: &mut ImageBuffer<P, C>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: P,
) where
    P: Pixel,
    C: DerefMut<Target = [P::Subpixel]>,
{
    let width = image.width() as i32;
    let height = image.height() as i32;
    let x0 = left.max(0);
    let x1 = right.min(width - 1);
    let y0 = top.max(0);
    let y1 = bottom.min(height - 1);

    for y in y0..=y1 {
        for x in x0..=x1 {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label<P, C>(image: &mut ImageBuffer<P, C>, mut x: i32, y: i32, text: &str, color: P)
where
    P: Pixel,
    C: DerefMut<Target = [P::Subpixel]>,
{
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                        let px = x.saturating_add(col);
                        if px >= 0 && px < width {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        x = x.saturating_add(GLYPH_ADVANCE);
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use ml_core::Rect;
    use proptest::prelude::*;
    use video_ingest::{Modality, PixelFormat};

    use super::*;

    fn black(width: u32, height: u32, format: PixelFormat) -> Frame {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Frame::new(Modality::Color, width, height, format, vec![0; len]).unwrap()
    }

    fn detection(class_id: i32, confidence: f32, rect: Rect) -> Detection {
        Detection {
            class_id,
            confidence,
            rect,
        }
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> &[u8] {
        let bpp = frame.bytes_per_pixel();
        let start = (y * frame.width() + x) as usize * bpp;
        &frame.data()[start..start + bpp]
    }

    #[test]
    fn labels_fall_back_to_confidence() {
        let classes = ClassNames::parse("ace\nking\n");
        let det = detection(1, 0.9, Rect::default());
        assert_eq!(label_text(&det, Some(&classes)), "king: 0.90");
        assert_eq!(label_text(&det, None), "0.90");
        let unknown = detection(7, 0.456, Rect::default());
        assert_eq!(label_text(&unknown, Some(&classes)), "0.46");
    }

    #[test]
    fn box_is_drawn_in_green() {
        let mut frame = black(64, 64, PixelFormat::Bgr8);
        let det = detection(0, 0.9, Rect::new(20, 30, 10, 10));
        assert!(annotate_frame(&mut frame, &[det], None));
        assert_eq!(pixel(&frame, 25, 40), &[0, 255, 0]);
        assert_eq!(pixel(&frame, 30, 35), &[0, 255, 0]);
        // interior untouched
        assert_eq!(pixel(&frame, 25, 35), &[0, 0, 0]);
    }

    #[test]
    fn label_background_sits_above_the_box() {
        let mut frame = black(64, 64, PixelFormat::Bgrx8);
        let det = detection(0, 0.5, Rect::new(10, 30, 20, 20));
        annotate_frame(&mut frame, &[det], None);
        // label box spans rows 21..=30, its top-left corner is background white
        assert_eq!(pixel(&frame, 10, 21), &[255, 255, 255, 255]);
    }

    #[test]
    fn label_is_clamped_to_the_top_edge() {
        let mut frame = black(64, 64, PixelFormat::Gray8);
        let det = detection(0, 0.5, Rect::new(5, 0, 20, 20));
        assert!(annotate_frame(&mut frame, &[det], None));
        assert_eq!(pixel(&frame, 5, 0), &[255]);
    }

    #[test]
    fn boxes_at_the_coordinate_limits_are_clipped() {
        let mut frame = black(16, 16, PixelFormat::Bgr8);
        let dets = [
            detection(0, 0.9, Rect::new(i32::MAX - 3, 10, 100, 10)),
            detection(0, 0.9, Rect::new(i32::MIN, i32::MIN, 10, 10)),
            detection(0, 0.9, Rect::new(-1_000_000_000, 4, 2_000_000_000, 2)),
        ];
        assert!(annotate_frame(&mut frame, &dets, None));
        // only the frame-spanning box reaches the pixels
        assert_eq!(pixel(&frame, 8, 6), &[0, 255, 0]);
    }

    proptest! {
        #[test]
        fn any_rectangle_can_be_drawn(
            x in any::<i32>(),
            y in any::<i32>(),
            width in any::<i32>(),
            height in any::<i32>(),
        ) {
            let mut frame = black(12, 12, PixelFormat::Rgb8);
            let det = detection(0, 0.75, Rect::new(x, y, width, height));
            prop_assert!(annotate_frame(&mut frame, &[det], None));
        }
    }

    #[test]
    fn float_frames_are_left_alone() {
        let mut frame = black(8, 8, PixelFormat::Float32);
        let det = detection(0, 0.5, Rect::new(1, 1, 4, 4));
        assert!(!annotate_frame(&mut frame, &[det], None));
        assert!(frame.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn every_label_character_has_a_glyph() {
        for ch in "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ:. -".chars() {
            assert!(glyph_bits(ch).is_some(), "missing glyph for {ch:?}");
        }
    }
}
