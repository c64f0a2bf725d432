use std::collections::VecDeque;

use trackid_featstore::vector::dot;

/// Density-based grouping of unit vectors.
///
/// Two vectors are neighbors when their dot product is at least
/// `min_similarity`. A vector with `min_samples` or more neighbors
/// (itself included) is a core point; groups are the connected components
/// of core points plus the border points they reach.
///
/// Returns one label per vector: `Some(group)` with groups numbered from 0
/// in discovery order, or `None` for noise. Returns `None` overall if
/// `is_cancelled` reports true while expanding.
pub(crate) fn dbscan(
    vectors: &[&[f32]],
    min_similarity: f32,
    min_samples: usize,
    is_cancelled: &dyn Fn() -> bool,
) -> Option<Vec<Option<usize>>> {
    let n = vectors.len();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut groups = 0;

    for start in 0..n {
        if visited[start] {
            continue;
        }
        if is_cancelled() {
            return None;
        }
        visited[start] = true;

        let around = neighbors(vectors, start, min_similarity);
        if around.len() < min_samples {
            // Noise for now; a later core point may still claim it.
            continue;
        }

        let group = groups;
        groups += 1;
        labels[start] = Some(group);

        let mut frontier: VecDeque<usize> = around.into();
        while let Some(p) = frontier.pop_front() {
            if labels[p].is_none() {
                labels[p] = Some(group);
            }
            if visited[p] {
                continue;
            }
            visited[p] = true;

            if is_cancelled() {
                return None;
            }
            let reach = neighbors(vectors, p, min_similarity);
            if reach.len() >= min_samples {
                frontier.extend(reach.into_iter().filter(|&q| !visited[q] || labels[q].is_none()));
            }
        }
    }

    Some(labels)
}

fn neighbors(vectors: &[&[f32]], of: usize, min_similarity: f32) -> Vec<usize> {
    let v = vectors[of];
    (0..vectors.len())
        .filter(|&i| dot(v, vectors[i]) >= min_similarity)
        .collect()
}
