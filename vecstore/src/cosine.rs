use trackid_featstore::vector::dot;

/// Similarity of two unit vectors (their dot product), clamped to `[-1, 1]`.
///
/// Returns -1 on dimension mismatch so a malformed pair never ranks above a
/// real match.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return -1.0;
    }
    dot(a, b).clamp(-1.0, 1.0)
}

/// Distance used internally for graph ordering: `1 - similarity`, in `[0, 2]`.
pub(crate) fn distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - similarity(a, b)
}
