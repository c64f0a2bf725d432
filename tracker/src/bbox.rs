use serde::{Deserialize, Serialize};

/// Axis-aligned box: top-left corner plus size, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Box of size `w`x`h` centered on (`cx`, `cy`).
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            w,
            h,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.w.is_finite() && self.h.is_finite()
    }

    /// Returns why the box is unusable, if it is.
    pub(crate) fn defect(&self) -> Option<&'static str> {
        if !self.is_finite() {
            Some("non-finite bbox")
        } else if self.w <= 0.0 || self.h <= 0.0 {
            Some("non-positive bbox size")
        } else {
            None
        }
    }

    /// Intersection-over-union in `[0, 1]`. Degenerate boxes score 0.
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let inter = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - inter;
        let iou = inter / union;
        if iou.is_finite() && union > 0.0 {
            iou.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}
