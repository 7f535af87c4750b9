//! Attaching body and pose detections to visible identities.
//!
//! Body and pose detections carry no embedding, so they are tied to an
//! identity through geometry: a person's face box should sit inside their body
//! (or pose) box. The pairing is solved optimally with the Jonker-Volgenant
//! solver over a `1 - containment` cost matrix.

use ndarray::Array2;
use tracing::debug;

use crate::identity::IdentityStore;
use crate::tracker::detection::{Detection, DetectionKind};
use crate::tracker::rect::Rect;

/// Cost of pairing each face (rows) with each region (columns).
pub(crate) fn containment_cost(faces: &[Rect], regions: &[Rect]) -> Array2<f32> {
    let mut cost = Array2::zeros((faces.len(), regions.len()));
    for (i, face) in faces.iter().enumerate() {
        for (j, region) in regions.iter().enumerate() {
            cost[[i, j]] = 1.0 - face.containment_in(region);
        }
    }
    cost
}

/// Minimum-cost one-to-one pairing, keeping only pairs with cost at most
/// `max_cost`. Returns `(row, column)` pairs.
pub(crate) fn solve_assignment(cost: &Array2<f32>, max_cost: f32) -> Vec<(usize, usize)> {
    let (rows, cols) = cost.dim();
    if rows == 0 || cols == 0 {
        return Vec::new();
    }

    // lapjv needs a square matrix. Pairs over the limit share one flat
    // cost so they never outbid a real pairing, and padding is dearer still.
    const REJECTED: f64 = 1e3;
    const PADDING: f64 = 1e6;

    let size = rows.max(cols);
    let mut padded = Array2::<f64>::from_elem((size, size), PADDING);
    for ((i, j), value) in cost.indexed_iter() {
        padded[[i, j]] = if *value <= max_cost {
            f64::from(*value)
        } else {
            REJECTED
        };
    }

    match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => row_to_col
            .into_iter()
            .enumerate()
            .filter(|&(row, col)| row < rows && col < cols && cost[[row, col]] <= max_cost)
            .collect(),
        Err(_) => {
            debug!("Assignment solver failed, leaving regions unattached");
            Vec::new()
        }
    }
}

/// Attach body and pose detections to the identities visible this frame.
/// Returns how many detections were attached.
pub(crate) fn associate_regions(
    store: &mut IdentityStore,
    detections: &[Detection],
    min_containment: f32,
) -> usize {
    let faces: Vec<(u64, Rect)> = store
        .visible()
        .filter_map(|identity| identity.boxes().face.map(|face| (identity.id(), face)))
        .collect();
    if faces.is_empty() {
        return 0;
    }
    let face_rects: Vec<Rect> = faces.iter().map(|(_, face)| *face).collect();

    let mut attached = 0;
    for kind in [DetectionKind::Body, DetectionKind::Pose] {
        let regions: Vec<&Detection> = detections
            .iter()
            .filter(|detection| detection.kind == kind && detection.bbox.is_valid())
            .collect();
        let region_rects: Vec<Rect> = regions.iter().map(|detection| detection.bbox).collect();

        let cost = containment_cost(&face_rects, &region_rects);
        for (row, col) in solve_assignment(&cost, 1.0 - min_containment) {
            let (id, _) = faces[row];
            let region = regions[col];
            let Ok(identity) = store.active_mut(id) else {
                continue;
            };
            match kind {
                DetectionKind::Body => identity.set_body_box(region.bbox),
                DetectionKind::Pose => identity.set_pose(region.bbox, region.keypoints.clone()),
                DetectionKind::Face => continue,
            }
            attached += 1;
        }
    }
    attached
}
