use pathfinding::kuhn_munkres::kuhn_munkres_min;
use pathfinding::matrix::Matrix;

use crate::bbox::BBox;

/// IoU is scaled to integer costs for the Hungarian solver.
const SCALE: f32 = 10_000.0;

/// Outcome of matching predicted track boxes to detections.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Association {
    /// (track index, detection index) pairs that passed the gate.
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// Minimum-cost bipartite matching on (1 - IoU). Pairs whose IoU falls
/// below `iou_gate` are discarded even when the solver picks them.
pub fn associate(tracks: &[BBox], detections: &[BBox], iou_gate: f32) -> Association {
    let mut track_matched = vec![false; tracks.len()];
    let mut det_matched = vec![false; detections.len()];
    let mut matches = Vec::new();

    if !tracks.is_empty() && !detections.is_empty() {
        // The solver requires rows <= columns, so transpose if needed.
        let transpose = tracks.len() > detections.len();
        let (rows, cols) = if transpose {
            (detections.len(), tracks.len())
        } else {
            (tracks.len(), detections.len())
        };

        let mut iou = Matrix::new(rows, cols, 0.0f32);
        let mut cost = Matrix::new(rows, cols, SCALE as i64);
        for r in 0..rows {
            for c in 0..cols {
                let (t, d) = if transpose { (c, r) } else { (r, c) };
                let v = tracks[t].iou(&detections[d]);
                iou[(r, c)] = v;
                cost[(r, c)] = ((1.0 - v) * SCALE).round() as i64;
            }
        }

        let (_total, assignment) = kuhn_munkres_min(&cost);
        for (r, &c) in assignment.iter().enumerate() {
            if iou[(r, c)] < iou_gate || iou[(r, c)] <= 0.0 {
                continue;
            }
            let (t, d) = if transpose { (c, r) } else { (r, c) };
            track_matched[t] = true;
            det_matched[d] = true;
            matches.push((t, d));
        }
        matches.sort_unstable();
    }

    Association {
        matches,
        unmatched_tracks: unmatched(&track_matched),
        unmatched_detections: unmatched(&det_matched),
    }
}

fn unmatched(flags: &[bool]) -> Vec<usize> {
    flags
        .iter()
        .enumerate()
        .filter(|(_, m)| !**m)
        .map(|(i, _)| i)
        .collect()
}
