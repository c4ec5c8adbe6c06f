//! Build-time tunables and the runtime [`Config`].
//!
//! Every constant can be overridden at build time through the environment variable named in its
//! documentation.

use embassy_time::Duration;
use motion_sense_utils::{bool_from_env_or, u32_from_env_or, usize_from_env_or};

/// Minimum spacing between two forced-mode collections, in milliseconds.
///
/// Override with `CONFIG_MOTION_MIN_SENSE_WAIT_TIME_MS`.
pub const MIN_SENSE_WAIT_TIME_MS: u32 = u32_from_env_or!(
    "CONFIG_MOTION_MIN_SENSE_WAIT_TIME_MS",
    3,
    "minimum spacing between two motion sense collections"
);

/// Delay before sensors are reconfigured after entering suspend, in microseconds.
pub const SUSPEND_DELAY_US: u32 = u32_from_env_or!(
    "CONFIG_MOTION_SENSE_SUSPEND_DELAY_US",
    0,
    "delay before reconfiguring sensors on suspend"
);

/// Delay before sensors are reconfigured after resuming, in microseconds.
pub const RESUME_DELAY_US: u32 = u32_from_env_or!(
    "CONFIG_MOTION_SENSE_RESUME_DELAY_US",
    0,
    "delay before reconfiguring sensors on resume"
);

/// Number of entries in the sample FIFO. Must be a power of two.
pub const FIFO_SIZE: usize = usize_from_env_or!(
    "CONFIG_ACCEL_FIFO_SIZE",
    256,
    "number of entries in the motion sense FIFO"
);

/// Free entries below which the host is notified.
pub const FIFO_THRES: usize = usize_from_env_or!(
    "CONFIG_ACCEL_FIFO_THRES",
    FIFO_SIZE / 3,
    "free FIFO entries below which the host is notified"
);

/// Host notification staleness bound used when the host has not set any rate, in milliseconds.
///
/// 0 disables the bound.
pub const FIFO_MAX_LATENCY_MS: u32 = u32_from_env_or!(
    "CONFIG_MOTION_FIFO_MAX_LATENCY_MS",
    0,
    "maximum time the host waits for FIFO data"
);

/// Bound on init retries, rate programming retries and consecutive read failures.
pub const MAX_RETRIES: u32 = u32_from_env_or!(
    "CONFIG_MOTION_SENSE_MAX_RETRIES",
    3,
    "retries before a sensor is marked as failed"
);

/// Whether every sample is preceded by its own timestamp entry.
pub const TIGHT_TIMESTAMPS: bool = bool_from_env_or!(
    "CONFIG_SENSOR_TIGHT_TIMESTAMPS",
    true,
    "stage a timestamp entry before every sample"
);

/// Whether a double tap wakes a suspended host.
///
/// Override with `CONFIG_GESTURE_SENSOR_DOUBLE_TAP_FOR_HOST`.
pub const DOUBLE_TAP_WAKES_HOST: bool = bool_from_env_or!(
    "CONFIG_GESTURE_SENSOR_DOUBLE_TAP_FOR_HOST",
    false,
    "wake the host on double tap"
);

/// Capacity of a single interrupt harvest.
pub const HARVEST_CAPACITY: usize = usize_from_env_or!(
    "CONFIG_MOTION_SENSE_HARVEST_CAPACITY",
    32,
    "maximum number of samples collected by one interrupt handler run"
);

/// Maximum number of motion sensors on a board.
///
/// Bounded by the number of per-sensor interrupt bits in [`Events`](crate::Events).
pub const MAX_MOTION_SENSORS: usize = 16;

/// Body detection tunables.
pub mod body_detection {
    use super::{bool_from_env_or, u32_from_env_or, usize_from_env_or};

    /// Largest variance window, in samples.
    pub const MAX_WINDOW_SIZE: usize = usize_from_env_or!(
        "CONFIG_BODY_DETECTION_MAX_WINDOW_SIZE",
        250,
        "largest body detection window in samples"
    );

    /// Variance threshold, in (mm/s²)².
    pub const VAR_THRESHOLD: u32 = u32_from_env_or!(
        "CONFIG_BODY_DETECTION_VAR_THRESHOLD",
        550,
        "body detection variance threshold"
    );

    /// Half-width of the confidence ramp around the threshold, in (mm/s²)².
    pub const CONFIDENCE_DELTA: u32 = u32_from_env_or!(
        "CONFIG_BODY_DETECTION_CONFIDENCE_DELTA",
        525,
        "body detection confidence delta"
    );

    /// Percentage of the sensor noise variance added to the threshold.
    pub const VAR_NOISE_FACTOR: u32 = u32_from_env_or!(
        "CONFIG_BODY_DETECTION_VAR_NOISE_FACTOR",
        120,
        "percentage of the sensor noise added to the threshold"
    );

    /// Confidence above which the device goes on body, in percent.
    pub const ON_BODY_CON: u32 = u32_from_env_or!(
        "CONFIG_BODY_DETECTION_ON_BODY_CON",
        50,
        "confidence above which the device is on body"
    );

    /// Confidence at or above which the stationary timer restarts, in percent.
    pub const OFF_BODY_CON: u32 = u32_from_env_or!(
        "CONFIG_BODY_DETECTION_OFF_BODY_CON",
        10,
        "confidence below which the device counts as stationary"
    );

    /// Stationary time after which the device goes off body, in seconds.
    pub const STATIONARY_DURATION: u32 = u32_from_env_or!(
        "CONFIG_BODY_DETECTION_STATIONARY_DURATION",
        15,
        "stationary seconds before the device is off body"
    );

    /// Forces body detection on whenever the system enters the running state.
    pub const ALWAYS_ENABLE_IN_S0: bool = bool_from_env_or!(
        "CONFIG_BODY_DETECTION_ALWAYS_ENABLE_IN_S0",
        false,
        "always enable body detection when running"
    );
}

/// Body detection parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BodyDetectionConfig {
    /// Index of the accelerometer feeding the detector.
    pub sensor: usize,
    pub max_window_size: usize,
    pub var_threshold: u32,
    pub confidence_delta: u32,
    pub var_noise_factor: u32,
    pub on_body_con: u32,
    pub off_body_con: u32,
    pub stationary_duration: u32,
    pub always_enable_in_s0: bool,
}

impl BodyDetectionConfig {
    /// Returns the build-time defaults for the given sensor.
    #[must_use]
    pub const fn new(sensor: usize) -> Self {
        Self {
            sensor,
            max_window_size: body_detection::MAX_WINDOW_SIZE,
            var_threshold: body_detection::VAR_THRESHOLD,
            confidence_delta: body_detection::CONFIDENCE_DELTA,
            var_noise_factor: body_detection::VAR_NOISE_FACTOR,
            on_body_con: body_detection::ON_BODY_CON,
            off_body_con: body_detection::OFF_BODY_CON,
            stationary_duration: body_detection::STATIONARY_DURATION,
            always_enable_in_s0: body_detection::ALWAYS_ENABLE_IN_S0,
        }
    }

    #[must_use]
    pub const fn with_stationary_duration(mut self, seconds: u32) -> Self {
        self.stationary_duration = seconds;
        self
    }

    #[must_use]
    pub const fn with_thresholds(mut self, var_threshold: u32, confidence_delta: u32) -> Self {
        self.var_threshold = var_threshold;
        self.confidence_delta = confidence_delta;
        self
    }

    #[must_use]
    pub const fn with_always_enable_in_s0(mut self, enable: bool) -> Self {
        self.always_enable_in_s0 = enable;
        self
    }
}

/// Runtime configuration of the subsystem.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Minimum spacing between two forced-mode collections.
    pub min_interval: Duration,
    pub suspend_delay: Duration,
    pub resume_delay: Duration,
    /// Free FIFO entries below which the host is notified.
    pub fifo_threshold: usize,
    /// Staleness bound when the host has not set any rate. Zero disables it.
    pub fifo_max_latency: Duration,
    pub max_retries: u32,
    pub tight_timestamps: bool,
    pub body_detection: Option<BodyDetectionConfig>,
    /// Sensors whose drivers expose gestures (activities) to the host.
    pub gesture_sensors: u32,
    /// Whether an activity pseudo-sensor is exposed to the host.
    pub host_gestures: bool,
    /// Whether double tap entries wake the host instead of only bypassing batching.
    pub double_tap_wakes_host: bool,
    /// Sensor whose orientation changes are reported to the host.
    pub orientation_sensor: Option<usize>,
}

impl Config {
    /// Returns the build-time defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            min_interval: Duration::from_millis(MIN_SENSE_WAIT_TIME_MS as u64),
            suspend_delay: Duration::from_micros(SUSPEND_DELAY_US as u64),
            resume_delay: Duration::from_micros(RESUME_DELAY_US as u64),
            fifo_threshold: FIFO_THRES,
            fifo_max_latency: Duration::from_millis(FIFO_MAX_LATENCY_MS as u64),
            max_retries: MAX_RETRIES,
            tight_timestamps: TIGHT_TIMESTAMPS,
            body_detection: None,
            gesture_sensors: 0,
            host_gestures: false,
            double_tap_wakes_host: DOUBLE_TAP_WAKES_HOST,
            orientation_sensor: None,
        }
    }

    #[must_use]
    pub const fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    #[must_use]
    pub const fn with_power_delays(mut self, suspend: Duration, resume: Duration) -> Self {
        self.suspend_delay = suspend;
        self.resume_delay = resume;
        self
    }

    #[must_use]
    pub const fn with_fifo_threshold(mut self, threshold: usize) -> Self {
        self.fifo_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_fifo_max_latency(mut self, latency: Duration) -> Self {
        self.fifo_max_latency = latency;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub const fn with_tight_timestamps(mut self, tight: bool) -> Self {
        self.tight_timestamps = tight;
        self
    }

    #[must_use]
    pub const fn with_body_detection(mut self, body_detection: BodyDetectionConfig) -> Self {
        self.body_detection = Some(body_detection);
        self
    }

    /// Marks `sensor` as a gesture source, exposing its activities to the host.
    #[must_use]
    pub const fn with_gesture_sensor(mut self, sensor: usize) -> Self {
        self.gesture_sensors |= 1 << sensor;
        self.host_gestures = true;
        self
    }

    /// Reports the orientation of `sensor` through the activity pseudo-sensor.
    #[must_use]
    pub const fn with_orientation_sensor(mut self, sensor: usize) -> Self {
        self.orientation_sensor = Some(sensor);
        self.with_gesture_sensor(sensor)
    }

    #[must_use]
    pub const fn with_double_tap_wakes_host(mut self, wakes: bool) -> Self {
        self.double_tap_wakes_host = wakes;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    assert!(FIFO_SIZE.is_power_of_two(), "CONFIG_ACCEL_FIFO_SIZE must be a power of two");
    assert!(FIFO_THRES < FIFO_SIZE);
};
