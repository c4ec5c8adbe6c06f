use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex},
    vec::Vec,
};

use embassy_time::{Duration, Instant};

use crate::{
    driver::{ActivityList, Harvest, Offset, Orientation},
    port::{Deferred, Port},
    Activity, Driver, Error, Events, MotionSense, Vector,
};

/// What the mock chip reports on its next interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqFrame {
    Sample(Vector),
    Invalid,
    Raise(Events),
}

/// Inspectable state of a [`MockDriver`].
#[derive(Debug, Default)]
pub struct MockState {
    pub init_calls: u32,
    pub init_failures: u32,
    pub rate_failures: u32,
    pub read_failures: u32,
    pub odr: u32,
    /// Rates the chip supports, ascending; empty accepts any rate.
    pub buckets: Vec<u32>,
    pub range: i32,
    pub resolution: u8,
    pub rms_noise: u32,
    pub reads: u32,
    pub samples: VecDeque<Vector>,
    pub last_sample: Vector,
    pub irq: bool,
    pub irq_frames: VecDeque<IrqFrame>,
    pub offset: Offset,
    pub activities: ActivityList,
    pub managed: Vec<(Activity, bool)>,
    pub orientation: Orientation,
}

/// Scriptable sensor driver.
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                range: 2,
                resolution: 16,
                ..MockState::default()
            })),
        }
    }

    /// Enables the interrupt handler.
    pub fn with_irq(self) -> Self {
        self.state.lock().unwrap().irq = true;
        self
    }

    pub fn with_activities(self, activities: ActivityList) -> Self {
        self.state.lock().unwrap().activities = activities;
        self
    }

    /// Returns a handle to inspect and script the driver while the subsystem owns it.
    pub fn handle(&self) -> Arc<Mutex<MockState>> {
        Arc::clone(&self.state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl Driver for MockDriver {
    fn init(&mut self) -> Result<(), Error> {
        let mut state = self.lock();
        state.init_calls += 1;
        if state.init_failures > 0 {
            state.init_failures -= 1;
            return Err(Error::Bus);
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Vector, Error> {
        let mut state = self.lock();
        if state.read_failures > 0 {
            state.read_failures -= 1;
            return Err(Error::Bus);
        }
        state.reads += 1;
        if let Some(sample) = state.samples.pop_front() {
            state.last_sample = sample;
        }
        Ok(state.last_sample)
    }

    fn set_range(&mut self, range: i32, _round_up: bool) -> Result<i32, Error> {
        if !(1..=16).contains(&range) {
            return Err(Error::InvalidParam);
        }
        self.lock().range = range;
        Ok(range)
    }

    fn resolution(&self) -> u8 {
        self.lock().resolution
    }

    fn rms_noise(&self) -> u32 {
        self.lock().rms_noise
    }

    fn set_data_rate(&mut self, rate_mhz: u32, round_up: bool) -> Result<(), Error> {
        let mut state = self.lock();
        if state.rate_failures > 0 {
            state.rate_failures -= 1;
            return Err(Error::Bus);
        }
        state.odr = bucket(&state.buckets, rate_mhz, round_up);
        Ok(())
    }

    fn data_rate(&self) -> u32 {
        self.lock().odr
    }

    fn set_offset(&mut self, offset: Offset) -> Result<(), Error> {
        self.lock().offset = offset;
        Ok(())
    }

    fn offset(&self) -> Result<Offset, Error> {
        Ok(self.lock().offset)
    }

    fn has_irq_handler(&self) -> bool {
        self.lock().irq
    }

    fn irq_handler(&mut self, harvest: &mut Harvest) -> Result<(), Error> {
        let frames = core::mem::take(&mut self.lock().irq_frames);
        for frame in frames {
            match frame {
                IrqFrame::Sample(xyz) => {
                    let _ = harvest.push(xyz);
                }
                IrqFrame::Invalid => harvest.invalidate(),
                IrqFrame::Raise(events) => harvest.raise(events),
            }
        }
        Ok(())
    }

    fn orientation(&self) -> Orientation {
        self.lock().orientation
    }

    fn list_activities(&self) -> Result<ActivityList, Error> {
        Ok(self.lock().activities)
    }

    fn manage_activity(&mut self, activity: Activity, enable: bool) -> Result<(), Error> {
        let mut state = self.lock();
        let mask = activity.mask();
        if (state.activities.enabled | state.activities.disabled) & mask == 0 {
            return Err(Error::InvalidParam);
        }
        if enable {
            state.activities.enabled |= mask;
            state.activities.disabled &= !mask;
        } else {
            state.activities.enabled &= !mask;
            state.activities.disabled |= mask;
        }
        state.managed.push((activity, enable));
        Ok(())
    }
}

/// Snaps `rate` to a supported rate, like chips with a discrete set of data rates.
fn bucket(buckets: &[u32], rate: u32, round_up: bool) -> u32 {
    if rate == 0 || buckets.is_empty() {
        return rate;
    }
    let below = buckets.iter().rev().find(|bucket| **bucket <= rate);
    let above = buckets.iter().find(|bucket| **bucket >= rate);
    let chosen = if round_up { above.or(below) } else { below.or(above) };
    chosen.copied().unwrap_or(rate)
}

/// Simulated platform: a manual clock, recorded deferred work and host notifications.
pub struct SimPort {
    now: Cell<Instant>,
    deferred: RefCell<Option<(Deferred, Duration)>>,
    notifications: Cell<u32>,
}

impl SimPort {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Instant::from_ticks(0)),
            deferred: RefCell::new(None),
            notifications: Cell::new(0),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }

    /// Runs the pending deferred work, if any, after its delay.
    pub fn run_deferred<const N: usize, const F: usize>(&self, motion: &MotionSense<'_, N, F>) {
        let pending = self.deferred.borrow_mut().take();
        if let Some((work, delay)) = pending {
            self.advance(delay);
            motion.run_deferred(work);
        }
    }

    pub fn notifications(&self) -> u32 {
        self.notifications.get()
    }
}

impl Port for SimPort {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> {
        self.advance(duration);
        core::future::ready(())
    }

    fn call_deferred(&self, work: Deferred, delay: Duration) {
        *self.deferred.borrow_mut() = Some((work, delay));
    }

    fn notify_host(&self) {
        self.notifications.set(self.notifications.get() + 1);
    }
}
