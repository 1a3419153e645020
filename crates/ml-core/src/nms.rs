use std::collections::BTreeMap;

use crate::detection::{Detection, Rect};

/// Greedy non-maximum suppression.
///
/// Candidates scoring above `score_threshold` are visited by descending score
/// (ties keep input order); one is kept when its IoU with every box kept so far is
/// at most `nms_threshold`. Returns indices into `rects` in keep order.
pub fn nms_boxes(
    rects: &[Rect],
    scores: &[f32],
    score_threshold: f32,
    nms_threshold: f32,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..rects.len().min(scores.len()))
        .filter(|i| scores[*i] > score_threshold)
        .collect();
    order.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));

    let mut kept: Vec<usize> = Vec::with_capacity(order.len());
    for candidate in order {
        if kept
            .iter()
            .all(|k| rects[*k].iou(&rects[candidate]) <= nms_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// Run [`nms_boxes`] independently for every class id, in ascending class order.
///
/// Only detections with `confidence >= conf_threshold` take part.
pub fn suppress_per_class(
    detections: &[Detection],
    conf_threshold: f32,
    nms_threshold: f32,
) -> Vec<Detection> {
    let mut by_class: BTreeMap<i32, Vec<Detection>> = BTreeMap::new();
    for det in detections.iter().filter(|d| d.confidence >= conf_threshold) {
        by_class.entry(det.class_id).or_default().push(*det);
    }

    let mut survivors = Vec::with_capacity(detections.len());
    for group in by_class.values() {
        let rects: Vec<Rect> = group.iter().map(|d| d.rect).collect();
        let scores: Vec<f32> = group.iter().map(|d| d.confidence).collect();
        survivors.extend(
            nms_boxes(&rects, &scores, conf_threshold, nms_threshold)
                .into_iter()
                .map(|i| group[i]),
        );
    }
    survivors
}
