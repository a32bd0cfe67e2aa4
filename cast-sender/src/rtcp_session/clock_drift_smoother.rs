use std::time::{Duration, Instant};

/// Smooths a noisy clock offset with an exponential moving average whose
/// weight grows with the time since the previous measurement.
#[derive(Debug, Clone)]
pub struct ClockDriftSmoother {
    time_constant: Duration,
    last_update_time: Option<Instant>,
    /// Smoothed offset in microseconds.
    estimate_us: f64,
}

impl ClockDriftSmoother {
    pub const DEFAULT_TIME_CONSTANT: Duration = Duration::from_secs(30);

    pub fn new(time_constant: Duration) -> Self {
        ClockDriftSmoother {
            time_constant,
            last_update_time: None,
            estimate_us: 0.0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.last_update_time.is_some()
    }

    /// Current estimate in microseconds; zero before the first measurement.
    pub fn current(&self) -> i64 {
        self.estimate_us.round() as i64
    }

    pub fn reset(&mut self, now: Instant, measured_offset_us: i64) {
        self.last_update_time = Some(now);
        self.estimate_us = measured_offset_us as f64;
    }

    pub fn update(&mut self, now: Instant, measured_offset_us: i64) {
        let Some(last_update_time) = self.last_update_time else {
            self.reset(now, measured_offset_us);
            return;
        };
        if now < last_update_time {
            return;
        }

        let elapsed = now - last_update_time;
        self.last_update_time = Some(now);
        let weight = 1.0 - (-elapsed.as_secs_f64() / self.time_constant.as_secs_f64()).exp();
        self.estimate_us = weight * measured_offset_us as f64 + (1.0 - weight) * self.estimate_us;
    }
}

impl Default for ClockDriftSmoother {
    fn default() -> Self {
        ClockDriftSmoother::new(ClockDriftSmoother::DEFAULT_TIME_CONSTANT)
    }
}
