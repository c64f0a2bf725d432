//! Small vector helpers shared by the store and the cluster engine.
//!
//! All helpers accumulate in f64 so that long vectors keep their precision.

/// Normalizes `v` to unit length in place and returns the original norm.
/// A zero vector is left untouched and 0 is returned.
pub fn l2_normalize(v: &mut [f32]) -> f64 {
    let norm = norm(v);
    if norm > 0.0 {
        let scale = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
    norm
}

/// Returns a unit-length copy of `v`, or `None` if `v` is zero or holds
/// non-finite components.
pub fn normalized(v: &[f32]) -> Option<Vec<f32>> {
    if v.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let mut out = v.to_vec();
    if l2_normalize(&mut out) == 0.0 {
        return None;
    }
    Some(out)
}

/// Euclidean norm.
pub fn norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

/// Dot product. For unit vectors this is the cosine similarity.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x as f64) * (y as f64))
        .sum::<f64>() as f32
}
