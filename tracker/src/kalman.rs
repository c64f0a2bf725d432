use nalgebra::{Matrix2, Matrix2x4, Matrix4, Vector2, Vector4};

/// The filter produced non-finite state or covariance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divergence;

/// Constant-velocity Kalman filter over a box centroid.
///
/// State: [cx, cy, vx, vy], advanced one frame per [`KalmanFilter::predict`].
/// Measurement: [cx, cy].
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    pub(crate) state: Vector4<f64>,
    pub(crate) covariance: Matrix4<f64>,
    process_noise: Matrix4<f64>,
    pub(crate) measurement_noise: Matrix2<f64>,
}

impl KalmanFilter {
    /// Starts at rest on (`cx`, `cy`). Velocity begins highly uncertain.
    pub fn new(cx: f64, cy: f64, process_noise: f64, measurement_noise: f64) -> Self {
        let state = Vector4::new(cx, cy, 0.0, 0.0);
        let covariance = Matrix4::from_diagonal(&Vector4::new(
            measurement_noise,
            measurement_noise,
            measurement_noise * 100.0,
            measurement_noise * 100.0,
        ));
        let process_noise = Matrix4::from_diagonal(&Vector4::new(
            process_noise,
            process_noise,
            process_noise * 0.5,
            process_noise * 0.5,
        ));
        let measurement_noise = Matrix2::identity() * measurement_noise;
        Self {
            state,
            covariance,
            process_noise,
            measurement_noise,
        }
    }

    fn transition() -> Matrix4<f64> {
        // x' = x + vx, y' = y + vy
        let mut f = Matrix4::identity();
        f[(0, 2)] = 1.0;
        f[(1, 3)] = 1.0;
        f
    }

    fn observation() -> Matrix2x4<f64> {
        Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0, // cx
            0.0, 1.0, 0.0, 0.0, // cy
        )
    }

    /// Advances one frame: x = F x, P = F P F^T + Q.
    pub fn predict(&mut self) {
        let f = Self::transition();
        self.state = f * self.state;
        self.covariance = f * self.covariance * f.transpose() + self.process_noise;
    }

    /// Corrects with a measured centroid. On [`Divergence`] the filter is
    /// left in its non-finite state and must be replaced.
    pub fn update(&mut self, cx: f64, cy: f64) -> Result<(), Divergence> {
        let h = Self::observation();
        let z = Vector2::new(cx, cy);

        let innovation = z - h * self.state;
        let s = h * self.covariance * h.transpose() + self.measurement_noise;
        let s_inv = s.try_inverse().ok_or(Divergence)?;
        let gain = self.covariance * h.transpose() * s_inv;

        self.state += gain * innovation;
        self.covariance = (Matrix4::identity() - gain * h) * self.covariance;

        if self.is_finite() { Ok(()) } else { Err(Divergence) }
    }

    pub fn position(&self) -> (f64, f64) {
        (self.state[0], self.state[1])
    }

    pub fn velocity(&self) -> (f64, f64) {
        (self.state[2], self.state[3])
    }

    pub fn is_finite(&self) -> bool {
        self.state.iter().all(|v| v.is_finite()) && self.covariance.iter().all(|v| v.is_finite())
    }
}
