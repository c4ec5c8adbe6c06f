//! On-body/off-body classification from accelerometer variance.
//!
//! The detector keeps a one-second window of the X and Y axes and maintains `n²·Var` for each
//! axis incrementally, so every sample costs O(1) regardless of the window size. The combined
//! variance is mapped to a confidence ramp around a threshold scaled to the sensor range.

use crate::config::{body_detection::MAX_WINDOW_SIZE, BodyDetectionConfig};

/// Acceleration of 1 g in mm/s².
const MM_PER_S2_1G: u64 = 9800;

/// Body state reported to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BodyState {
    OffBody = 0,
    OnBody = 1,
}

impl TryFrom<u8> for BodyState {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::OffBody),
            1 => Ok(Self::OnBody),
            _ => Err(crate::Error::InvalidParam),
        }
    }
}

/// Maps a variance to a confidence, in percent.
///
/// 0 below `threshold - delta`, 100 above `threshold + delta`, linear in between.
#[must_use]
pub fn motion_confidence(var: u64, threshold: u64, delta: u64) -> u32 {
    if var < threshold.saturating_sub(delta) {
        return 0;
    }
    if var > threshold.saturating_add(delta) || delta == 0 {
        return 100;
    }
    let above = u128::from(var.saturating_add(delta).saturating_sub(threshold));
    let confidence = 100 * above / (2 * u128::from(delta));
    u32::try_from(confidence).unwrap_or(100)
}

/// Ring of past samples of one axis with its running sums.
#[derive(Debug, Clone)]
struct AxisHistory {
    history: [i32; MAX_WINDOW_SIZE],
    sum: i64,
    /// `n·Σx² − (Σx)²` over the window.
    n2_variance: i64,
}

impl AxisHistory {
    const fn new() -> Self {
        Self {
            history: [0; MAX_WINDOW_SIZE],
            sum: 0,
            n2_variance: 0,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    /// Replaces the sample at `index` of a window of `n` samples with `x`.
    fn update(&mut self, index: usize, n: usize, x: i32) {
        let Some(slot) = self.history.get_mut(index) else {
            return;
        };
        let x_n = i64::from(x);
        let x_0 = i64::from(*slot);
        *slot = x;

        let n = n as i64;
        let sum_prev = self.sum;
        self.sum += x_n - x_0;
        self.n2_variance += (x_n - x_0) * (n * (x_n + x_0) - self.sum - sum_prev);
    }
}

/// Variance-based body detector.
#[derive(Debug, Clone)]
pub struct BodyDetector {
    params: BodyDetectionConfig,
    window_size: usize,
    var_threshold: u64,
    confidence_delta: u64,
    state: BodyState,
    /// Externally observed state while a spoof lock is held.
    spoofed: Option<BodyState>,
    last_reported: BodyState,
    stationary_timeframe: u32,
    history_index: usize,
    history_initialized: bool,
    enabled: bool,
    last_confidence: u32,
    axes: [AxisHistory; 2],
}

impl BodyDetector {
    #[must_use]
    pub const fn new(params: BodyDetectionConfig) -> Self {
        Self {
            params,
            window_size: 1,
            var_threshold: params.var_threshold as u64,
            confidence_delta: params.confidence_delta as u64,
            state: BodyState::OffBody,
            spoofed: None,
            last_reported: BodyState::OffBody,
            stationary_timeframe: 0,
            history_index: 0,
            history_initialized: false,
            enabled: true,
            last_confidence: 0,
            axes: [AxisHistory::new(), AxisHistory::new()],
        }
    }

    /// Re-arms the detector for a new sensor configuration.
    ///
    /// The window spans one second at `odr_mhz`; thresholds are converted to the sensor counts
    /// given by `range` (in g) and `resolution` (in bits). `rms_noise` is in µg.
    pub fn reset(&mut self, odr_mhz: u32, range: i32, resolution: u8, rms_noise: u32) {
        let max_window = self.params.max_window_size.clamp(1, MAX_WINDOW_SIZE);
        self.window_size = (odr_mhz / 1000).clamp(1, max_window as u32) as usize;

        // Squares of 32-bit counts do not fit in 64 bits.
        let range = u128::from(range.max(1).unsigned_abs());
        let data_1g = (1u128 << resolution.saturating_sub(1).min(62)) / range;
        let multiplier = data_1g * data_1g;
        let divisor = u128::from(MM_PER_S2_1G * MM_PER_S2_1G);
        let to_counts = |value: u128| {
            u64::try_from(value.saturating_mul(multiplier) / divisor).unwrap_or(u64::MAX)
        };

        let rms = u128::from(rms_noise);
        let var_noise = rms * rms * u128::from(self.params.var_noise_factor) * 98 * 98
            / 100
            / (10_000 * 10_000);

        self.var_threshold = to_counts(u128::from(self.params.var_threshold) + var_noise);
        self.confidence_delta = to_counts(u128::from(self.params.confidence_delta));
        self.stationary_timeframe = 0;
        self.clear_history();

        motion_sense_log::debug!(
            "body detect: window {} threshold {} delta {}",
            self.window_size,
            self.var_threshold,
            self.confidence_delta
        );
    }

    /// Feeds one sample.
    ///
    /// Returns the new externally observed state when it changed.
    pub fn update(&mut self, x: i32, y: i32) -> Option<BodyState> {
        if !self.enabled {
            return None;
        }
        let n = self.window_size;
        for (axis, value) in self.axes.iter_mut().zip([x, y]) {
            axis.update(self.history_index, n, value);
        }
        self.history_index = (self.history_index + 1) % n;

        if !self.history_initialized {
            self.history_initialized = self.history_index == 0;
            return None;
        }

        let confidence = motion_confidence(
            self.variance(),
            self.var_threshold,
            self.confidence_delta,
        );
        self.last_confidence = confidence;
        self.classify(confidence);
        self.report()
    }

    fn classify(&mut self, confidence: u32) {
        match self.state {
            BodyState::OffBody => {
                if confidence > self.params.on_body_con {
                    self.state = BodyState::OnBody;
                    self.stationary_timeframe = 0;
                }
            }
            BodyState::OnBody => {
                self.stationary_timeframe += 1;
                if confidence >= self.params.off_body_con {
                    self.stationary_timeframe = 0;
                }
                let window = self.window_size as u32;
                if self.stationary_timeframe >= self.params.stationary_duration * window {
                    self.state = BodyState::OffBody;
                    self.stationary_timeframe = 0;
                }
            }
        }
    }

    fn report(&mut self) -> Option<BodyState> {
        let state = self.state();
        if state == self.last_reported {
            return None;
        }
        self.last_reported = state;
        Some(state)
    }

    fn clear_history(&mut self) {
        for axis in &mut self.axes {
            axis.clear();
        }
        self.history_index = 0;
        self.history_initialized = false;
    }

    /// Combined X/Y variance over the window, in counts².
    #[must_use]
    pub fn variance(&self) -> u64 {
        let n = self.window_size as i64;
        let n2 = self.axes.iter().map(|a| a.n2_variance).sum::<i64>();
        u64::try_from(n2 / n / n).unwrap_or(0)
    }

    /// Externally observed state.
    #[must_use]
    pub fn state(&self) -> BodyState {
        self.spoofed.unwrap_or(self.state)
    }

    #[must_use]
    pub fn last_confidence(&self) -> u32 {
        self.last_confidence
    }

    #[must_use]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Scaled variance threshold and confidence delta, in counts².
    #[must_use]
    pub fn thresholds(&self) -> (u64, u64) {
        (self.var_threshold, self.confidence_delta)
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables classification; re-enabling restarts the window.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.clear_history();
            self.stationary_timeframe = 0;
        }
        self.enabled = enabled;
    }

    #[must_use]
    pub fn spoofing(&self) -> bool {
        self.spoofed.is_some()
    }

    /// Freezes the observed state at its current value, or releases the lock.
    ///
    /// Classification keeps running underneath; after a release the next evaluation reports
    /// the classifier state.
    pub fn lock_current(&mut self, lock: bool) {
        self.spoofed = lock.then(|| self.state());
    }

    /// Forces the observed state.
    ///
    /// Returns the state when the change must be reported.
    pub fn spoof(&mut self, state: BodyState) -> Option<BodyState> {
        self.spoofed = Some(state);
        self.report()
    }

    #[must_use]
    pub fn config(&self) -> &BodyDetectionConfig {
        &self.params
    }
}
