/// Exponentially weighted moving average.
///
/// The first sample seeds the value; later samples blend in with weight
/// `alpha` (`0.0 < alpha <= 1.0`). Higher alpha tracks the input closely,
/// lower alpha keeps more history.
#[derive(Debug, Clone)]
pub struct Ewma {
    value: f64,
    alpha: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            value: 0.0,
            alpha,
            initialized: false,
        }
    }

    /// Feed a measurement. NaN and infinite values are ignored so a single
    /// bad sample cannot poison the average.
    pub fn update(&mut self, measurement: f64) {
        if !measurement.is_finite() {
            return;
        }
        if self.initialized {
            self.value = self.value * (1.0 - self.alpha) + measurement * self.alpha;
        } else {
            self.value = measurement;
            self.initialized = true;
        }
    }

    /// Smoothed value, 0.0 before the first sample.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Smoothed value, or `None` before the first sample.
    pub fn get(&self) -> Option<f64> {
        self.initialized.then_some(self.value)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
