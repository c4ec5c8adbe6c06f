use core::cell::RefCell;

use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex as BlockingMutex},
    mutex::Mutex,
};
use embassy_time::Instant;
use portable_atomic::{AtomicU32, AtomicU8, Ordering};

use crate::{
    body_detect::BodyDetector,
    config::{Config, FIFO_SIZE, MAX_MOTION_SENSORS},
    driver::{Activity, Driver},
    events::{SensorMask, TaskEvents},
    fifo::{AsyncEvent, Entry, EntryFlags, SampleFifo},
    sensor::{SensorInfo, SensorRuntime, SensorState, Vector},
    Error, Events, PowerState,
};

/// A sensor of the board table: its description and its driver.
pub struct Sensor<'d> {
    pub(crate) info: SensorInfo,
    pub(crate) driver: Mutex<CriticalSectionRawMutex, &'d mut (dyn Driver + Send)>,
}

impl<'d> Sensor<'d> {
    pub fn new(info: SensorInfo, driver: &'d mut (dyn Driver + Send)) -> Self {
        Self {
            info,
            driver: Mutex::new(driver),
        }
    }

    #[must_use]
    pub fn info(&self) -> &SensorInfo {
        &self.info
    }
}

/// State shared between the task, the host command handler and the power hooks.
pub(crate) struct Shared<const N: usize, const F: usize> {
    pub sensors: [SensorRuntime; N],
    pub fifo: SampleFifo<F, N>,
    pub body: Option<BodyDetector>,
    pub body_was_enabled: bool,
    pub fifo_int_enabled: bool,
    /// Start of the latest task iteration, as a FIFO timestamp.
    pub last_timestamp: u32,
    pub double_tap_wakes_host: bool,
}

impl<const N: usize, const F: usize> Shared<N, F> {
    /// Records a sample of `sensor` and stages it unless oversampling drops it.
    ///
    /// Returns the value recorded, after spoofing.
    pub fn stage_sample(&mut self, sensor: usize, raw: Vector, timestamp: u32) -> Option<Vector> {
        let rt = self.sensors.get_mut(sensor)?;
        rt.raw_xyz = raw;
        let xyz = if rt.spoofing { rt.spoof_xyz } else { raw };
        rt.xyz = xyz;
        if rt.keep_sample() {
            self.fifo
                .stage_unit(Entry::data(sensor_num(sensor), xyz), timestamp);
        }
        Some(xyz)
    }

    pub fn insert_async_event(&mut self, sensor: usize, event: AsyncEvent, timestamp: u32) {
        self.fifo
            .stage_unit(Entry::async_event(sensor_num(sensor), event, timestamp), timestamp);
        self.fifo.commit();
    }

    /// Stages an activity change of the activity pseudo-sensor.
    pub fn stage_activity(&mut self, activity: Activity, state: u8, timestamp: u32) {
        let mut entry = Entry::activity(sensor_num(N), activity as u8, state);
        match activity {
            // Unless configured otherwise, taps skip batching without waking the host.
            Activity::DoubleTap if !self.double_tap_wakes_host => {
                entry.flags = EntryFlags::BYPASS_FIFO;
            }
            Activity::Orientation => entry.flags = EntryFlags::empty(),
            _ => {}
        }
        self.fifo.stage_unit(entry, timestamp);
    }
}

/// The motion sense subsystem.
///
/// Shared by reference between the [`MotionTask`](crate::MotionTask), the host command handler,
/// the power hooks and interrupt handlers.
pub struct MotionSense<'d, const N: usize, const F: usize = FIFO_SIZE> {
    pub(crate) sensors: [Sensor<'d>; N],
    pub(crate) config: Config,
    shared: BlockingMutex<CriticalSectionRawMutex, RefCell<Shared<N, F>>>,
    power: AtomicU8,
    pub(crate) events: TaskEvents,
    pub(crate) odr_pending: SensorMask,
    pub(crate) setup_pending: SensorMask,
    pub(crate) reinit_pending: SensorMask,
    pub(crate) flush_pending: [AtomicU8; N],
    irq_timestamps: [AtomicU32; N],
}

impl<'d, const N: usize, const F: usize> MotionSense<'d, N, F> {
    /// Creates the subsystem, powered off.
    ///
    /// # Panics
    ///
    /// Panics if the body detection or orientation sensor is out of range.
    pub fn new(sensors: [Sensor<'d>; N], config: Config) -> Self {
        const { assert!(N <= MAX_MOTION_SENSORS, "too many motion sensors") };
        if let Some(body) = config.body_detection {
            assert!(body.sensor < N, "body detection sensor out of range");
        }
        if let Some(sensor) = config.orientation_sensor {
            assert!(sensor < N, "orientation sensor out of range");
        }

        let shared = Shared {
            sensors: sensors.each_ref().map(|sensor| SensorRuntime::new(&sensor.info)),
            fifo: SampleFifo::new(config.tight_timestamps),
            body: config.body_detection.map(BodyDetector::new),
            body_was_enabled: true,
            fifo_int_enabled: false,
            last_timestamp: 0,
            double_tap_wakes_host: config.double_tap_wakes_host,
        };

        Self {
            sensors,
            config,
            shared: BlockingMutex::new(RefCell::new(shared)),
            power: AtomicU8::new(PowerState::Off as u8),
            events: TaskEvents::new(),
            odr_pending: SensorMask::new(),
            setup_pending: SensorMask::new(),
            reinit_pending: SensorMask::new(),
            flush_pending: core::array::from_fn(|_| AtomicU8::new(0)),
            irq_timestamps: core::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Runs `f` with the shared state locked.
    pub(crate) fn with_shared<R>(&self, f: impl FnOnce(&mut Shared<N, F>) -> R) -> R {
        self.shared.lock(|shared| f(&mut shared.borrow_mut()))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn sensor_count(&self) -> usize {
        N
    }

    /// Host-visible id of the activity pseudo-sensor.
    #[must_use]
    pub const fn activity_sensor_id(&self) -> usize {
        N
    }

    #[must_use]
    pub fn info(&self, sensor: usize) -> Option<&SensorInfo> {
        self.sensors.get(sensor).map(Sensor::info)
    }

    #[must_use]
    pub fn power_state(&self) -> PowerState {
        PowerState::from_u8(self.power.load(Ordering::Acquire))
    }

    pub(crate) fn set_power_state(&self, power: PowerState) {
        self.power.store(power as u8, Ordering::Release);
    }

    #[must_use]
    pub fn sensor_state(&self, sensor: usize) -> Option<SensorState> {
        self.with_shared(|s| s.sensors.get(sensor).map(|rt| rt.state))
    }

    /// Whether `sensor` is powered in the current power state.
    #[must_use]
    pub fn is_active(&self, sensor: usize) -> bool {
        self.info(sensor)
            .is_some_and(|info| info.active_mask.contains(self.power_state().mask()))
    }

    /// Latest reading of `sensor`, after spoofing.
    #[must_use]
    pub fn last_reading(&self, sensor: usize) -> Option<Vector> {
        self.with_shared(|s| s.sensors.get(sensor).map(|rt| rt.xyz))
    }

    /// Collection period of `sensor`, in microseconds, 0 when not collecting.
    #[must_use]
    pub fn collection_rate(&self, sensor: usize) -> Option<u64> {
        self.with_shared(|s| s.sensors.get(sensor).map(|rt| rt.collection_rate))
    }

    #[must_use]
    pub fn body_state(&self) -> Option<crate::BodyState> {
        self.with_shared(|s| s.body.as_ref().map(BodyDetector::state))
    }

    /// Signals an interrupt of `sensor`.
    ///
    /// Safe to call from interrupt context: it only latches the timestamp and raises an event.
    pub fn interrupt(&self, sensor: usize, timestamp: Instant) {
        if let Some(latched) = self.irq_timestamps.get(sensor) {
            latched.store(fifo_timestamp(timestamp), Ordering::Release);
            self.events.set(Events::interrupt(sensor));
        }
    }

    pub(crate) fn irq_timestamp(&self, sensor: usize) -> u32 {
        self.irq_timestamps
            .get(sensor)
            .map_or(0, |latched| latched.load(Ordering::Acquire))
    }

    /// Requests a fresh initialization of `sensor`, also out of the failed state.
    pub fn reinit(&self, sensor: usize) -> Result<(), Error> {
        if !self.is_active(sensor) {
            return Err(Error::NotReady);
        }
        self.reinit_pending.set(sensor);
        self.setup_pending.set(sensor);
        self.events.set(Events::SETUP);
        Ok(())
    }

    /// Requests one more flush marker for `sensor`.
    pub(crate) fn request_flush(&self, sensor: usize) {
        if let Some(pending) = self.flush_pending.get(sensor) {
            pending.fetch_add(1, Ordering::AcqRel);
            self.events.set(Events::FLUSH_PENDING);
        }
    }

    pub(crate) fn take_flushes(&self, sensor: usize) -> u8 {
        self.flush_pending
            .get(sensor)
            .map_or(0, |pending| pending.swap(0, Ordering::AcqRel))
    }

    /// Requests the rate of `sensor` to be reprogrammed by the task.
    pub(crate) fn request_odr(&self, sensor: usize) {
        self.odr_pending.set(sensor);
        self.events.set(Events::ODR_CHANGE);
    }

    /// Counts a failed read, marking the sensor failed once the retries are exhausted.
    pub(crate) fn record_read_failure(&self, sensor: usize, err: Error) {
        let max_retries = self.config.max_retries;
        let failed = self.with_shared(|s| {
            let rt = s.sensors.get_mut(sensor)?;
            rt.read_failures += 1;
            if rt.read_failures >= max_retries {
                rt.mark_failed();
                Some(true)
            } else {
                Some(false)
            }
        });
        match failed {
            Some(true) => {
                motion_sense_log::error!("sensor {}: read failed ({:?}), giving up", sensor, err);
            }
            Some(false) => {
                motion_sense_log::warn!("sensor {}: read failed ({:?})", sensor, err);
            }
            None => {}
        }
    }
}

/// Truncates `instant` to the 32-bit microsecond timestamps of the FIFO.
#[must_use]
pub fn fifo_timestamp(instant: Instant) -> u32 {
    instant.as_micros() as u32
}

fn sensor_num(sensor: usize) -> u8 {
    u8::try_from(sensor).unwrap_or(u8::MAX)
}
