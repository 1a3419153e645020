//! Decoding of raw network outputs into discrete detections.

use tracing::{debug, warn};

use crate::{
    backend::{BackendInfo, OutputLayerKind},
    detection::{Detection, Rect},
    nms::suppress_per_class,
    tensor::OutputTensor,
};

const RECORD_LEN: usize = 7;
/// First per-class score column of a grid row.
const GRID_SCORE_OFFSET: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostprocessConfig {
    pub conf_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

/// Turn the outputs of one forward pass into detections in frame coordinates.
///
/// `frame_size` is the `(width, height)` of the frame the blob was built from;
/// relative coordinates are scaled by it.
pub fn postprocess(
    outputs: &[OutputTensor],
    info: &BackendInfo,
    frame_size: (u32, u32),
    config: &PostprocessConfig,
) -> Vec<Detection> {
    let Some(kind) = info.primary_kind() else {
        warn!("Backend reports no output layers");
        return Vec::new();
    };

    let detections = match kind {
        OutputLayerKind::FixedRecord => decode_records(outputs, frame_size, config.conf_threshold),
        OutputLayerKind::Grid => decode_grid(outputs, frame_size, config.conf_threshold),
        OutputLayerKind::Unknown(name) => {
            warn!("Unknown output layer type: {name}");
            return Vec::new();
        }
    };

    let needs_suppression = info.layers.len() > 1
        || (*kind == OutputLayerKind::Grid && !info.suppresses_internally);
    if needs_suppression {
        suppress_per_class(&detections, config.conf_threshold, config.nms_threshold)
    } else {
        detections
    }
}

fn decode_records(
    outputs: &[OutputTensor],
    (frame_w, frame_h): (u32, u32),
    conf_threshold: f32,
) -> Vec<Detection> {
    if outputs.is_empty() {
        debug!("Forward pass returned no outputs");
    }

    let mut detections = Vec::new();
    for output in outputs {
        for record in output.data.chunks_exact(RECORD_LEN) {
            let confidence = record[2];
            if confidence <= conf_threshold {
                continue;
            }

            // `as` saturates; widen so the extent arithmetic cannot overflow.
            let mut left = record[3] as i32 as i64;
            let mut top = record[4] as i32 as i64;
            let mut right = record[5] as i32 as i64;
            let mut bottom = record[6] as i32 as i64;
            if right - left + 1 <= 2 || bottom - top + 1 <= 2 {
                left = (record[3] * frame_w as f32) as i32 as i64;
                top = (record[4] * frame_h as f32) as i32 as i64;
                right = (record[5] * frame_w as f32) as i32 as i64;
                bottom = (record[6] * frame_h as f32) as i32 as i64;
            }

            // class 0 is the background
            let class_id = i32::try_from(record[1] as i32 as i64 - 1).ok();
            let rect = checked_rect(left, top, right - left + 1, bottom - top + 1);
            let (Some(class_id), Some(rect)) = (class_id, rect) else {
                debug!("Skipping record outside the pixel range: {record:?}");
                continue;
            };
            detections.push(Detection {
                class_id,
                confidence,
                rect,
            });
        }
    }
    detections
}

fn decode_grid(
    outputs: &[OutputTensor],
    (frame_w, frame_h): (u32, u32),
    conf_threshold: f32,
) -> Vec<Detection> {
    let mut detections = Vec::new();
    for output in outputs {
        if !output.is_consistent() || output.cols <= GRID_SCORE_OFFSET {
            debug!(
                "Skipping malformed grid output {}x{} ({} values)",
                output.rows,
                output.cols,
                output.data.len()
            );
            continue;
        }

        for row in (0..output.rows).filter_map(|r| output.row(r)) {
            let Some((class_id, confidence)) = best_score(&row[GRID_SCORE_OFFSET..]) else {
                continue;
            };
            if confidence <= conf_threshold {
                continue;
            }

            let center_x = (row[0] * frame_w as f32) as i32 as i64;
            let center_y = (row[1] * frame_h as f32) as i32 as i64;
            let width = (row[2] * frame_w as f32) as i32 as i64;
            let height = (row[3] * frame_h as f32) as i32 as i64;
            let rect = checked_rect(center_x - width / 2, center_y - height / 2, width, height);
            let (Ok(class_id), Some(rect)) = (i32::try_from(class_id), rect) else {
                debug!("Skipping grid row outside the pixel range");
                continue;
            };
            detections.push(Detection {
                class_id,
                confidence,
                rect,
            });
        }
    }
    detections
}

/// Rectangle whose corners all fit in `i32` pixel coordinates.
fn checked_rect(x: i64, y: i64, width: i64, height: i64) -> Option<Rect> {
    let fits = |value: i64| i32::try_from(value).ok();
    fits(x + width)?;
    fits(y + height)?;
    Some(Rect::new(fits(x)?, fits(y)?, fits(width)?, fits(height)?))
}

/// Index and value of the highest score; the first maximum wins.
fn best_score(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (index, score)| match best {
            Some((_, top)) if score <= top => best,
            _ => Some((index, score)),
        })
}
