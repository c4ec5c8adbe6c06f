use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant};

use crate::{
    body_detect::BodyState,
    config::{FIFO_SIZE, HARVEST_CAPACITY},
    driver::{Activity, Harvest, Orientation},
    events::sensors_in,
    fifo::AsyncEvent,
    motion::fifo_timestamp,
    port::Port,
    sensor::{Requester, SensorState, Vector},
    Driver, Error, Events, MotionSense, PowerState,
};

/// Outcome of one iteration of the task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Iteration {
    /// Sensors that produced data in this iteration.
    pub fresh: u32,
    /// Whether the FIFO was flushed towards the host.
    pub notified: bool,
    /// Time until the next iteration is due, `None` to wait for events only.
    pub wait: Option<Duration>,
}

/// The motion sense task.
///
/// Single consumer of [`Events`]: it initializes sensors, programs rates, collects samples and
/// decides when to notify the host.
pub struct MotionTask<'a, 'd, P, const N: usize, const F: usize = FIFO_SIZE> {
    motion: &'a MotionSense<'d, N, F>,
    port: &'a P,
    last_notification: Instant,
    raised: [Events; N],
    body_samples: heapless::Vec<Vector, { HARVEST_CAPACITY + 1 }>,
    orientation: Orientation,
}

impl<'a, 'd, P: Port, const N: usize, const F: usize> MotionTask<'a, 'd, P, N, F> {
    pub fn new(motion: &'a MotionSense<'d, N, F>, port: &'a P) -> Self {
        Self {
            motion,
            port,
            last_notification: port.now(),
            raised: [Events::empty(); N],
            body_samples: heapless::Vec::new(),
            orientation: Orientation::Unknown,
        }
    }

    /// Runs the task forever.
    pub async fn run(&mut self) -> ! {
        let mut events = self.motion.events.take();
        loop {
            let iteration = self.iterate(events).await;
            events = match iteration.wait {
                Some(wait) => match select(self.motion.events.wait(), self.port.sleep(wait)).await
                {
                    Either::First(events) => events,
                    Either::Second(()) => self.motion.events.take(),
                },
                None => self.motion.events.wait().await,
            };
        }
    }

    /// Runs one iteration with the events pending right now.
    pub async fn step(&mut self) -> Iteration {
        let events = self.motion.events.take();
        self.iterate(events).await
    }

    /// Runs one iteration of the task for `events`.
    pub async fn iterate(&mut self, mut events: Events) -> Iteration {
        let motion = self.motion;
        let start = self.port.now();
        motion.with_shared(|s| {
            s.last_timestamp = fifo_timestamp(start);
            s.fifo.set_read_timestamp(s.last_timestamp);
        });

        if events.contains(Events::FORGET_ACTIVITIES) {
            self.forget_activities().await;
        }
        if self.setup_sensors().await {
            events |= Events::ODR_CHANGE;
        }

        let mut fresh = 0u32;
        for sensor in 0..N {
            if !motion.is_active(sensor) {
                continue;
            }
            match self.process(sensor, events, start).await {
                Ok(true) => fresh |= 1 << sensor,
                Ok(false) => {}
                Err(err) => {
                    motion_sense_log::debug!("sensor {}: not processed ({:?})", sensor, err);
                }
            }
        }

        self.run_body_detection(fresh, start);
        self.queue_gestures(start).await;
        self.update_orientation(start).await;

        let notified = self.notify_host_if_needed(events, start);
        let wait = self.next_wait(self.port.now());
        motion_sense_log::trace!("motion sense: fresh {} notified {}", fresh, notified);

        Iteration {
            fresh,
            notified,
            wait,
        }
    }

    /// Initializes or restores the sensors queued for setup.
    ///
    /// Returns whether some rate must be programmed.
    async fn setup_sensors(&mut self) -> bool {
        let motion = self.motion;
        let pending = motion.setup_pending.take_all();
        let reinit = motion.reinit_pending.take_all();
        let mut odr = 0u32;

        for i in sensors_in(pending | reinit) {
            let Some(sensor) = motion.sensors.get(i) else {
                continue;
            };
            if !motion.is_active(i) {
                continue;
            }
            let forced_init = reinit & (1 << i) != 0;
            let Some((state, range)) =
                motion.with_shared(|s| s.sensors.get(i).map(|rt| (rt.state, rt.current_range)))
            else {
                continue;
            };

            let mut driver = sensor.driver.lock().await;
            match state {
                SensorState::Initialized | SensorState::Ready if !forced_init => {
                    match driver.set_range(range, false) {
                        Ok(range) => motion.with_shared(|s| {
                            if let Some(rt) = s.sensors.get_mut(i) {
                                rt.current_range = range;
                            }
                        }),
                        Err(err) => {
                            motion_sense_log::warn!(
                                "sensor {}: restoring range failed ({:?})",
                                i,
                                err
                            );
                        }
                    }
                    odr |= 1 << i;
                }
                SensorState::InitError if !forced_init => {}
                _ => {
                    if self.init_sensor(i, &mut **driver, range).await.is_ok() {
                        odr |= 1 << i;
                    }
                }
            }
        }

        motion.odr_pending.set_mask(odr);
        odr != 0
    }

    async fn init_sensor(
        &self,
        i: usize,
        driver: &mut (dyn Driver + Send),
        range: i32,
    ) -> Result<(), Error> {
        let motion = self.motion;
        let mut result = Err(Error::InitFailed);
        for attempt in 0..motion.config.max_retries {
            if attempt > 0 {
                self.port.sleep(Duration::from_millis(1)).await;
            }
            result = driver.init().and_then(|()| driver.set_range(range, false));
            if result.is_ok() {
                break;
            }
        }

        match result {
            Ok(range) => {
                motion.with_shared(|s| {
                    if let Some(rt) = s.sensors.get_mut(i) {
                        rt.state = SensorState::Initialized;
                        rt.current_range = range;
                        rt.collection_rate = 0;
                        rt.read_failures = 0;
                        rt.rate_failures = 0;
                    }
                });
                motion_sense_log::info!("sensor {}: initialized", i);
                Ok(())
            }
            Err(err) => {
                motion.with_shared(|s| {
                    if let Some(rt) = s.sensors.get_mut(i) {
                        rt.mark_failed();
                    }
                });
                motion_sense_log::error!("sensor {}: init failed ({:?})", i, err);
                Err(Error::InitFailed)
            }
        }
    }

    /// Services one sensor: drains its interrupt, programs its rate, polls it when due.
    ///
    /// Returns whether the sensor produced data.
    async fn process(&mut self, i: usize, events: Events, now: Instant) -> Result<bool, Error> {
        let motion = self.motion;
        let sensor = motion.sensors.get(i).ok_or(Error::InvalidParam)?;
        let odr_pending = events.contains(Events::ODR_CHANGE) && motion.odr_pending.take(i);
        let state = motion.sensor_state(i).ok_or(Error::InvalidParam)?;
        if !(state == SensorState::Ready || (state == SensorState::Initialized && odr_pending)) {
            return Err(Error::NotReady);
        }

        let body_sensor = motion.config.body_detection.map(|body| body.sensor) == Some(i);
        let timestamp = fifo_timestamp(now);
        let mut fresh = false;
        let mut driver = sensor.driver.lock().await;

        if (events.intersects(Events::interrupt(i)) || odr_pending) && driver.has_irq_handler() {
            let mut harvest = Harvest::new(motion.irq_timestamp(i));
            if let Err(err) = driver.irq_handler(&mut harvest) {
                motion_sense_log::warn!("sensor {}: irq handler failed ({:?})", i, err);
            }
            if harvest.discarded() > 0 {
                motion_sense_log::warn!(
                    "sensor {}: discarded {} harvested samples",
                    i,
                    harvest.discarded()
                );
            }
            if let Some(raised) = self.raised.get_mut(i) {
                *raised |= harvest.raised();
            }
            fresh |= self.commit_harvest(i, &harvest, body_sensor);
        }

        let rate_changed = odr_pending && motion.program_rate(i, &mut **driver, now).is_ok();

        if sensor.info.forced_mode {
            let min_interval = motion.config.min_interval;
            let due = motion.with_shared(|s| {
                let rt = s.sensors.get_mut(i)?;
                if !rt.time_to_read(now, min_interval) {
                    return None;
                }
                let missed = rt.advance_collection(now, min_interval);
                Some((missed, rt.spoofing, rt.raw_xyz))
            });

            if let Some((missed, spoofing, previous)) = due {
                if missed > 0 {
                    motion_sense_log::warn!("sensor {}: missed {} collections", i, missed);
                }
                let reading = if spoofing { Ok(previous) } else { driver.read() };
                match reading {
                    Ok(raw) => {
                        let xyz = motion.with_shared(|s| {
                            let xyz = s.stage_sample(i, raw, timestamp);
                            s.fifo.commit();
                            if let Some(rt) = s.sensors.get_mut(i) {
                                rt.read_failures = 0;
                            }
                            xyz
                        });
                        if let (true, Some(xyz)) = (body_sensor, xyz) {
                            let _ = self.body_samples.push(xyz);
                        }
                        fresh = true;
                    }
                    Err(err) => motion.record_read_failure(i, err),
                }
            }
        }
        drop(driver);

        if events.contains(Events::FLUSH_PENDING) {
            let flushes = motion.take_flushes(i);
            if flushes > 0 {
                motion.with_shared(|s| {
                    for _ in 0..flushes {
                        s.insert_async_event(i, AsyncEvent::Flush, timestamp);
                    }
                });
            }
        }
        if rate_changed {
            motion.with_shared(|s| s.insert_async_event(i, AsyncEvent::Odr, timestamp));
        }

        Ok(fresh)
    }

    /// Stages and commits a harvest as one unit.
    fn commit_harvest(&mut self, i: usize, harvest: &Harvest, body_sensor: bool) -> bool {
        let samples = harvest.samples();
        if samples.is_empty() {
            return false;
        }
        let body_samples = &mut self.body_samples;
        self.motion.with_shared(|s| {
            for sample in samples {
                let xyz = s.stage_sample(i, sample.xyz, sample.timestamp);
                if let (true, Some(xyz)) = (body_sensor, xyz) {
                    let _ = body_samples.push(xyz);
                }
            }
            s.fifo.commit();
        });
        true
    }

    fn run_body_detection(&mut self, fresh: u32, now: Instant) {
        let Some(body) = self.motion.config.body_detection else {
            return;
        };
        if fresh & (1 << body.sensor) == 0 || self.body_samples.is_empty() {
            self.body_samples.clear();
            return;
        }
        let timestamp = fifo_timestamp(now);
        let samples = &self.body_samples;
        let change = self.motion.with_shared(|s| {
            let mut change = None;
            for xyz in samples {
                let [x, y, _] = *xyz;
                let update = s.body.as_mut().and_then(|body| body.update(x, y));
                if let Some(state) = update {
                    s.stage_activity(Activity::BodyDetection, state as u8, timestamp);
                    change = Some(state);
                }
            }
            s.fifo.commit();
            change
        });
        self.body_samples.clear();

        if let Some(state) = change {
            motion_sense_log::info!(
                "body detect: {}",
                if state == BodyState::OnBody { "on body" } else { "off body" }
            );
        }
    }

    /// Queues the gestures raised by drivers during this iteration.
    async fn queue_gestures(&mut self, now: Instant) {
        let motion = self.motion;
        let timestamp = fifo_timestamp(now);
        for i in 0..N {
            let Some(raised) = self
                .raised
                .get_mut(i)
                .map(|raised| core::mem::replace(raised, Events::empty()))
            else {
                continue;
            };
            if raised.is_empty() {
                continue;
            }

            if raised.contains(Events::DOUBLE_TAP) && motion.config.host_gestures {
                motion_sense_log::info!("sensor {}: double tap", i);
                motion.with_shared(|s| {
                    s.stage_activity(Activity::DoubleTap, 1, timestamp);
                    s.fifo.commit();
                });
            }
            if raised.contains(Events::SIG_MOTION) {
                motion_sense_log::info!("sensor {}: significant motion", i);
                if motion.config.host_gestures {
                    motion.with_shared(|s| {
                        s.stage_activity(Activity::SigMotion, 1, timestamp);
                        s.fifo.commit();
                    });
                }
                // Significant motion is one-shot: the host re-arms it.
                if let Some(sensor) = motion.sensors.get(i) {
                    let mut driver = sensor.driver.lock().await;
                    if let Err(err) = driver.manage_activity(Activity::SigMotion, false) {
                        motion_sense_log::warn!("sensor {}: disarming failed ({:?})", i, err);
                    }
                }
            }
        }
    }

    /// Queues the orientation reported by the orientation sensor when it changes.
    async fn update_orientation(&mut self, now: Instant) {
        let motion = self.motion;
        let Some(i) = motion.config.orientation_sensor else {
            return;
        };
        if !motion.is_active(i) || motion.sensor_state(i) != Some(SensorState::Ready) {
            return;
        }
        let Some(sensor) = motion.sensors.get(i) else {
            return;
        };
        let orientation = sensor.driver.lock().await.orientation();
        if orientation == self.orientation || orientation == Orientation::Unknown {
            return;
        }
        self.orientation = orientation;
        motion_sense_log::info!("sensor {}: orientation {:?}", i, orientation);
        motion.with_shared(|s| {
            s.stage_activity(Activity::Orientation, orientation as u8, fifo_timestamp(now));
            s.fifo.commit();
        });
    }

    /// Disables the gestures the host enabled, once the host is gone.
    async fn forget_activities(&mut self) {
        let motion = self.motion;
        for i in sensors_in(motion.config.gesture_sensors) {
            let Some(sensor) = motion.sensors.get(i) else {
                continue;
            };
            let mut driver = sensor.driver.lock().await;
            let Ok(list) = driver.list_activities() else {
                continue;
            };
            for activity in [Activity::SigMotion, Activity::DoubleTap, Activity::Orientation] {
                if list.enabled & activity.mask() != 0 {
                    if let Err(err) = driver.manage_activity(activity, false) {
                        motion_sense_log::warn!(
                            "sensor {}: disabling activity failed ({:?})",
                            i,
                            err
                        );
                    }
                }
            }
        }
    }

    /// Minimum interval between two host notifications, if bounded.
    fn host_event_interval(&self) -> Option<Duration> {
        let motion = self.motion;
        let host_rate = motion.with_shared(|s| {
            s.sensors
                .iter()
                .enumerate()
                .filter(|(i, _)| motion.is_active(*i))
                .map(|(_, rt)| rt.config.get(Requester::Host).ec_rate_us)
                .filter(|rate| *rate > 0)
                .min()
        });
        match host_rate {
            Some(rate) => Some(Duration::from_micros(u64::from(rate))),
            None if motion.config.fifo_max_latency > Duration::from_ticks(0) => {
                Some(motion.config.fifo_max_latency)
            }
            None => None,
        }
    }

    /// Flushes the FIFO towards the host when anything requires it.
    fn notify_host_if_needed(&mut self, events: Events, now: Instant) -> bool {
        let motion = self.motion;
        let interrupt_needed = self
            .host_event_interval()
            .is_some_and(|interval| now >= self.last_notification + interval);
        let threshold = motion.config.fifo_threshold;
        let (bypass_needed, over_threshold) =
            motion.with_shared(|s| (s.fifo.bypass_needed(), s.fifo.over_threshold(threshold)));

        if !(bypass_needed
            || interrupt_needed
            || over_threshold
            || events.intersects(Events::ODR_CHANGE | Events::FLUSH_PENDING))
        {
            return false;
        }

        let (wake_up_needed, fifo_int_enabled) = motion.with_shared(|s| {
            // Flush markers already carry a timestamp.
            if !events.contains(Events::FLUSH_PENDING) {
                s.fifo.add_timestamp(fifo_timestamp(now));
            }
            let flags = (s.fifo.wake_up_needed(), s.fifo_int_enabled);
            s.fifo.reset_needed_flags();
            flags
        });

        if (fifo_int_enabled && motion.power_state() == PowerState::Running) || wake_up_needed {
            self.port.notify_host();
        }
        self.last_notification = now;
        true
    }

    /// Time until the next forced-mode collection or staleness deadline.
    fn next_wait(&self, now: Instant) -> Option<Duration> {
        let motion = self.motion;
        let deadlines = motion.with_shared(|s| {
            s.sensors
                .iter()
                .zip(&motion.sensors)
                .enumerate()
                .filter(|(i, (rt, sensor))| {
                    sensor.info.forced_mode && rt.collection_rate != 0 && motion.is_active(*i)
                })
                .map(|(_, (rt, _))| rt.next_collection)
                .min()
        });
        let staleness = self
            .host_event_interval()
            .map(|interval| self.last_notification + interval);

        let next = match (deadlines, staleness) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b)?,
        };
        let wait = next.saturating_duration_since(now);
        if wait == Duration::from_ticks(0) {
            Some(wait)
        } else {
            Some(wait.max(motion.config.min_interval))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::indexing_slicing)]

    use embassy_futures::block_on;

    use super::*;
    use crate::{
        sensor::RateRequest,
        testing::{MockDriver, SimPort},
        Config, Location, SensorInfo, SensorKind,
    };

    const ACCEL: SensorInfo = SensorInfo::new("base accel", SensorKind::Accel, Location::Base)
        .with_config(Requester::Running, RateRequest::new(10_000, false));

    fn config() -> Config {
        Config::new().with_fifo_threshold(8)
    }

    fn set_host_odr<const N: usize>(motion: &MotionSense<'_, N, 64>, sensor: usize, odr_mhz: u32) {
        motion.with_shared(|s| {
            if let Some(host) = s.sensors[sensor].config.get_mut(Requester::Host) {
                host.odr_mhz = odr_mhz;
            }
        });
    }

    fn boot<const N: usize>(motion: &MotionSense<'_, N, 64>, port: &SimPort) {
        motion.on_startup(port, PowerState::Running);
        port.run_deferred(motion);
    }

    #[test]
    fn startup_initializes_and_programs_rate() {
        let mut driver = MockDriver::new();
        let mock = driver.handle();
        let motion: MotionSense<'_, 1, 64> =
            MotionSense::new([crate::Sensor::new(ACCEL, &mut driver)], config());
        let port = SimPort::new();
        assert_eq!(motion.sensor_state(0), Some(SensorState::Uninitialized));

        boot(&motion, &port);
        let mut task = MotionTask::new(&motion, &port);
        let iteration = block_on(task.step());

        assert_eq!(motion.sensor_state(0), Some(SensorState::Ready));
        assert_eq!(mock.lock().unwrap().odr, 10_000);
        assert_eq!(motion.collection_rate(0), Some(100_000));
        assert!(iteration.notified);
        assert_eq!(iteration.wait, Some(Duration::from_millis(100)));
    }

    #[test]
    fn init_gives_up_after_retries() {
        let mut driver = MockDriver::new();
        let mock = driver.handle();
        mock.lock().unwrap().init_failures = 3;
        let motion: MotionSense<'_, 1, 64> =
            MotionSense::new([crate::Sensor::new(ACCEL, &mut driver)], config());
        let port = SimPort::new();
        boot(&motion, &port);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());

        assert_eq!(motion.sensor_state(0), Some(SensorState::InitError));
        assert_eq!(mock.lock().unwrap().init_calls, 3);

        // Power transitions leave a failed sensor alone.
        motion.on_suspend(&port);
        port.run_deferred(&motion);
        block_on(task.step());
        assert_eq!(mock.lock().unwrap().init_calls, 3);

        motion.on_resume(&port);
        port.run_deferred(&motion);
        block_on(task.step());
        assert_eq!(motion.sensor_state(0), Some(SensorState::InitError));
        assert_eq!(mock.lock().unwrap().init_calls, 3);

        // An explicit reinit tries again.
        motion.reinit(0).unwrap();
        block_on(task.step());
        assert_eq!(motion.sensor_state(0), Some(SensorState::Ready));
        assert_eq!(mock.lock().unwrap().init_calls, 4);
    }

    #[test]
    fn init_succeeds_within_retries() {
        let mut driver = MockDriver::new();
        let mock = driver.handle();
        mock.lock().unwrap().init_failures = 2;
        let motion: MotionSense<'_, 1, 64> =
            MotionSense::new([crate::Sensor::new(ACCEL, &mut driver)], config());
        let port = SimPort::new();
        boot(&motion, &port);
        block_on(MotionTask::new(&motion, &port).step());

        assert_eq!(motion.sensor_state(0), Some(SensorState::Ready));
        assert_eq!(mock.lock().unwrap().init_calls, 3);
    }

    #[test]
    fn schedule_follows_the_rate_read_back() {
        let mut driver = MockDriver::new();
        let mock = driver.handle();
        mock.lock().unwrap().buckets = vec![12_500, 25_000, 50_000];
        let motion: MotionSense<'_, 1, 64> =
            MotionSense::new([crate::Sensor::new(ACCEL, &mut driver)], config());
        let port = SimPort::new();
        boot(&motion, &port);
        block_on(MotionTask::new(&motion, &port).step());

        // 10 Hz is not supported: the chip runs at 12.5 Hz.
        assert_eq!(mock.lock().unwrap().odr, 12_500);
        assert_eq!(motion.collection_rate(0), Some(80_000));
    }

    #[test]
    fn rate_failure_keeps_state_then_fails() {
        let mut driver = MockDriver::new();
        let mock = driver.handle();
        mock.lock().unwrap().rate_failures = 5;
        let motion: MotionSense<'_, 1, 64> =
            MotionSense::new([crate::Sensor::new(ACCEL, &mut driver)], config());
        let port = SimPort::new();
        boot(&motion, &port);
        let mut task = MotionTask::new(&motion, &port);

        block_on(task.step());
        assert_eq!(motion.sensor_state(0), Some(SensorState::Initialized));
        assert_eq!(motion.collection_rate(0), Some(0));

        block_on(task.step());
        assert_eq!(motion.sensor_state(0), Some(SensorState::Initialized));

        block_on(task.step());
        assert_eq!(motion.sensor_state(0), Some(SensorState::InitError));
        assert_eq!(motion.collection_rate(0), Some(0));
    }

    #[test]
    fn suspend_powers_down_running_only_sensors() {
        let mut base = MockDriver::new();
        let mut lid = MockDriver::new();
        let lid_info = SensorInfo::new("lid accel", SensorKind::Accel, Location::Lid)
            .with_active_mask(crate::PowerStates::RUNNING)
            .with_config(Requester::Running, RateRequest::new(10_000, false));
        let motion: MotionSense<'_, 2, 64> = MotionSense::new(
            [
                crate::Sensor::new(ACCEL, &mut base),
                crate::Sensor::new(lid_info, &mut lid),
            ],
            config(),
        );
        let port = SimPort::new();
        boot(&motion, &port);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());
        assert_eq!(motion.sensor_state(1), Some(SensorState::Ready));

        motion.on_suspend(&port);
        port.run_deferred(&motion);
        assert_eq!(motion.sensor_state(1), Some(SensorState::Uninitialized));
        assert_eq!(motion.collection_rate(1), Some(0));
        block_on(task.step());
        // The base accelerometer has no suspend rate configured.
        assert_eq!(motion.sensor_state(0), Some(SensorState::Initialized));

        motion.on_resume(&port);
        port.run_deferred(&motion);
        block_on(task.step());
        assert_eq!(motion.sensor_state(0), Some(SensorState::Ready));
        assert_eq!(motion.sensor_state(1), Some(SensorState::Ready));
    }

    #[test]
    fn forced_sensor_is_polled_on_schedule() {
        let mut driver = MockDriver::new();
        let mock = driver.handle();
        let motion: MotionSense<'_, 1, 64> =
            MotionSense::new([crate::Sensor::new(ACCEL, &mut driver)], config());
        let port = SimPort::new();
        boot(&motion, &port);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());
        assert_eq!(mock.lock().unwrap().reads, 0);

        port.advance(Duration::from_millis(50));
        let iteration = block_on(task.step());
        assert_eq!(iteration.fresh, 0);
        assert_eq!(iteration.wait, Some(Duration::from_millis(50)));

        mock.lock().unwrap().samples.push_back([1, 2, 3]);
        port.advance(Duration::from_millis(50));
        let iteration = block_on(task.step());
        assert_eq!(iteration.fresh, 1);
        assert_eq!(motion.last_reading(0), Some([1, 2, 3]));
        assert_eq!(iteration.wait, Some(Duration::from_millis(100)));
    }

    #[test]
    fn wait_is_clamped_to_the_minimum_interval() {
        let mut driver = MockDriver::new();
        let motion: MotionSense<'_, 1, 64> =
            MotionSense::new([crate::Sensor::new(ACCEL, &mut driver)], config());
        let port = SimPort::new();
        boot(&motion, &port);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());

        // Next collection is due at 100 ms.
        assert_eq!(task.next_wait(Instant::from_millis(99)), Some(Duration::from_millis(3)));
        assert_eq!(
            task.next_wait(Instant::from_millis(100)),
            Some(Duration::from_ticks(0))
        );
        assert_eq!(
            task.next_wait(Instant::from_millis(150)),
            Some(Duration::from_ticks(0))
        );
        assert_eq!(task.next_wait(Instant::from_millis(40)), Some(Duration::from_millis(60)));
    }

    #[test]
    fn no_wait_without_forced_sensors() {
        let mut driver = MockDriver::new();
        let info = ACCEL.interrupt_driven();
        let motion: MotionSense<'_, 1, 64> =
            MotionSense::new([crate::Sensor::new(info, &mut driver)], config());
        let port = SimPort::new();
        boot(&motion, &port);
        let mut task = MotionTask::new(&motion, &port);
        let iteration = block_on(task.step());
        assert_eq!(iteration.wait, None);
    }

    #[test]
    fn missed_collections_are_skipped() {
        let mut driver = MockDriver::new();
        let mock = driver.handle();
        let motion: MotionSense<'_, 1, 64> =
            MotionSense::new([crate::Sensor::new(ACCEL, &mut driver)], config());
        let port = SimPort::new();
        boot(&motion, &port);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());

        port.advance(Duration::from_millis(450));
        block_on(task.step());
        assert_eq!(mock.lock().unwrap().reads, 1);
        block_on(task.step());
        assert_eq!(mock.lock().unwrap().reads, 1);
    }

    #[test]
    fn interrupt_harvest_is_committed_as_a_unit() {
        let mut driver = MockDriver::new().with_irq();
        let mock = driver.handle();
        let info = ACCEL.interrupt_driven();
        let motion: MotionSense<'_, 1, 64> = MotionSense::new(
            [crate::Sensor::new(info, &mut driver)],
            config().with_tight_timestamps(false),
        );
        let port = SimPort::new();
        boot(&motion, &port);
        set_host_odr(&motion, 0, 10_000);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());
        let before = motion.with_shared(|s| s.fifo.len());

        {
            let mut mock = mock.lock().unwrap();
            mock.irq_frames.push_back(crate::testing::IrqFrame::Sample([1, 1, 1]));
            mock.irq_frames.push_back(crate::testing::IrqFrame::Sample([2, 2, 2]));
            mock.irq_frames.push_back(crate::testing::IrqFrame::Invalid);
            mock.irq_frames.push_back(crate::testing::IrqFrame::Sample([3, 3, 3]));
        }
        motion.interrupt(0, port.now());
        let iteration = block_on(task.step());

        assert_eq!(iteration.fresh, 1);
        // Both valid samples, without a flush timestamp.
        assert_eq!(motion.with_shared(|s| s.fifo.len()), before + 2);
        assert_eq!(motion.last_reading(0), Some([2, 2, 2]));
    }

    #[test]
    fn gestures_are_queued_and_significant_motion_disarmed() {
        let activities = crate::ActivityList {
            enabled: Activity::SigMotion.mask() | Activity::DoubleTap.mask(),
            disabled: 0,
        };
        let mut driver = MockDriver::new().with_irq().with_activities(activities);
        let mock = driver.handle();
        let motion: MotionSense<'_, 1, 64> = MotionSense::new(
            [crate::Sensor::new(ACCEL.interrupt_driven(), &mut driver)],
            config().with_tight_timestamps(false).with_gesture_sensor(0),
        );
        let port = SimPort::new();
        boot(&motion, &port);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());
        motion.with_shared(|s| while s.fifo.pop_committed().is_some() {});

        let raise = |events| {
            mock.lock()
                .unwrap()
                .irq_frames
                .push_back(crate::testing::IrqFrame::Raise(events));
            motion.interrupt(0, port.now());
        };

        raise(Events::DOUBLE_TAP);
        assert!(block_on(task.step()).notified);
        let tap = motion.with_shared(|s| s.fifo.pop_committed()).unwrap();
        assert_eq!(tap.flags, crate::fifo::EntryFlags::BYPASS_FIFO);
        assert_eq!(tap.sensor_num, 1);
        // By default taps do not wake the host.
        assert_eq!(port.notifications(), 0);
        motion.with_shared(|s| while s.fifo.pop_committed().is_some() {});

        raise(Events::SIG_MOTION);
        assert!(block_on(task.step()).notified);
        let motion_entry = motion.with_shared(|s| s.fifo.pop_committed()).unwrap();
        assert_eq!(motion_entry.flags, crate::fifo::EntryFlags::WAKEUP);
        assert_eq!(port.notifications(), 1);
        assert_eq!(mock.lock().unwrap().managed, vec![(Activity::SigMotion, false)]);
    }

    #[test]
    fn double_tap_wakes_the_host_when_configured() {
        let activities = crate::ActivityList {
            enabled: Activity::DoubleTap.mask(),
            disabled: 0,
        };
        let mut driver = MockDriver::new().with_irq().with_activities(activities);
        let mock = driver.handle();
        let info = ACCEL
            .interrupt_driven()
            .with_config(Requester::Suspended, RateRequest::new(10_000, false));
        let motion: MotionSense<'_, 1, 64> = MotionSense::new(
            [crate::Sensor::new(info, &mut driver)],
            config()
                .with_tight_timestamps(false)
                .with_gesture_sensor(0)
                .with_double_tap_wakes_host(true),
        );
        let port = SimPort::new();
        motion.on_startup(&port, PowerState::Suspended);
        port.run_deferred(&motion);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());
        motion.with_shared(|s| while s.fifo.pop_committed().is_some() {});
        assert_eq!(port.notifications(), 0);

        mock.lock()
            .unwrap()
            .irq_frames
            .push_back(crate::testing::IrqFrame::Raise(Events::DOUBLE_TAP));
        motion.interrupt(0, port.now());
        assert!(block_on(task.step()).notified);

        let tap = motion.with_shared(|s| s.fifo.pop_committed()).unwrap();
        assert_eq!(tap.flags, crate::fifo::EntryFlags::WAKEUP);
        assert_eq!(port.notifications(), 1);
    }

    #[test]
    fn orientation_changes_are_batched() {
        let mut driver = MockDriver::new();
        let mock = driver.handle();
        let motion: MotionSense<'_, 1, 64> = MotionSense::new(
            [crate::Sensor::new(ACCEL, &mut driver)],
            config().with_tight_timestamps(false).with_orientation_sensor(0),
        );
        let port = SimPort::new();
        boot(&motion, &port);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());
        motion.with_shared(|s| while s.fifo.pop_committed().is_some() {});
        let activities = || {
            motion.with_shared(|s| {
                core::iter::from_fn(|| s.fifo.pop_committed())
                    .filter(|entry| entry.sensor_num == 1)
                    .collect::<Vec<_>>()
            })
        };

        mock.lock().unwrap().orientation = Orientation::Portrait;
        assert!(!block_on(task.step()).notified);
        let entries = activities();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].flags, crate::fifo::EntryFlags::empty());
        assert_eq!(
            entries[0].payload,
            crate::fifo::Payload::Activity {
                activity: Activity::Orientation as u8,
                state: Orientation::Portrait as u8,
                add_info: [0; 2],
            }
        );

        // Unchanged or unknown orientations are not reported.
        block_on(task.step());
        mock.lock().unwrap().orientation = Orientation::Unknown;
        block_on(task.step());
        assert!(activities().is_empty());

        mock.lock().unwrap().orientation = Orientation::InvertedLandscape;
        block_on(task.step());
        assert_eq!(activities().len(), 1);
    }

    #[test]
    fn harvested_burst_is_spread_over_the_period() {
        let mut driver = MockDriver::new().with_irq();
        let mock = driver.handle();
        let motion: MotionSense<'_, 1, 64> = MotionSense::new(
            [crate::Sensor::new(ACCEL.interrupt_driven(), &mut driver)],
            config(),
        );
        let port = SimPort::new();
        boot(&motion, &port);
        set_host_odr(&motion, 0, 10_000);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());
        motion.with_shared(|s| while s.fifo.pop_committed().is_some() {});

        port.advance(Duration::from_secs(1));
        let irq = port.now();
        for i in 0..4 {
            mock.lock()
                .unwrap()
                .irq_frames
                .push_back(crate::testing::IrqFrame::Sample([i; 3]));
        }
        motion.interrupt(0, irq);
        port.advance(Duration::from_millis(400));
        block_on(task.step());

        let stamps: Vec<u32> = motion.with_shared(|s| {
            core::iter::from_fn(|| s.fifo.pop_committed())
                .filter(|entry| entry.sensor_num == 0)
                .filter(|entry| entry.flags == crate::fifo::EntryFlags::TIMESTAMP)
                .filter_map(|entry| match entry.payload {
                    crate::fifo::Payload::Timestamp(timestamp) => Some(timestamp),
                    _ => None,
                })
                .collect()
        });
        let irq = fifo_timestamp(irq);
        assert_eq!(stamps, [irq, irq + 100_000, irq + 200_000, irq + 300_000]);
    }

    #[test]
    fn host_is_notified_once_the_fifo_is_stale() {
        let mut driver = MockDriver::new();
        let motion: MotionSense<'_, 1, 64> = MotionSense::new(
            [crate::Sensor::new(ACCEL, &mut driver)],
            config().with_fifo_max_latency(Duration::from_millis(250)),
        );
        let port = SimPort::new();
        boot(&motion, &port);
        motion.with_shared(|s| s.fifo_int_enabled = true);
        let mut task = MotionTask::new(&motion, &port);
        assert!(block_on(task.step()).notified);
        assert_eq!(port.notifications(), 1);

        port.advance(Duration::from_millis(100));
        assert!(!block_on(task.step()).notified);
        port.advance(Duration::from_millis(100));
        let iteration = block_on(task.step());
        assert!(!iteration.notified);
        assert_eq!(iteration.wait, Some(Duration::from_millis(50)));

        port.advance(Duration::from_millis(50));
        assert!(block_on(task.step()).notified);
        assert_eq!(port.notifications(), 2);
    }

    #[test]
    fn suspended_host_is_only_woken_for_wake_events() {
        let mut driver = MockDriver::new();
        let motion: MotionSense<'_, 1, 64> =
            MotionSense::new([crate::Sensor::new(ACCEL, &mut driver)], config());
        let port = SimPort::new();
        motion.on_startup(&port, PowerState::Suspended);
        port.run_deferred(&motion);
        motion.with_shared(|s| s.fifo_int_enabled = true);
        let mut task = MotionTask::new(&motion, &port);
        block_on(task.step());
        assert_eq!(port.notifications(), 0);

        motion.with_shared(|s| {
            s.stage_activity(Activity::BodyDetection, 1, 0);
            s.fifo.commit();
        });
        assert!(block_on(task.step()).notified);
        assert_eq!(port.notifications(), 1);
    }
}
