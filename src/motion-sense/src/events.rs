use core::{future::poll_fn, task::Poll};

use embassy_sync::waitqueue::AtomicWaker;
use portable_atomic::{AtomicU32, Ordering};

use crate::config::MAX_MOTION_SENSORS;

bitflags::bitflags! {
    /// Events waking the motion sense task.
    ///
    /// The low bits carry one interrupt flag per sensor.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Events: u32 {
        /// Per-sensor interrupts, see [`Events::interrupt()`].
        const INTERRUPTS = (1 << MAX_MOTION_SENSORS) - 1;
        /// A sensor rate must be (re)programmed.
        const ODR_CHANGE = 1 << 16;
        /// The host asked for a flush marker.
        const FLUSH_PENDING = 1 << 17;
        /// Sensors must be set up after a power transition or a reinit request.
        const SETUP = 1 << 18;
        /// Host gestures must be disabled after shutdown.
        const FORGET_ACTIVITIES = 1 << 19;
        /// Significant motion was detected by a driver.
        const SIG_MOTION = 1 << 20;
        /// A double tap was detected by a driver.
        const DOUBLE_TAP = 1 << 21;
    }
}

impl Events {
    /// Returns the interrupt flag of `sensor`.
    #[must_use]
    pub const fn interrupt(sensor: usize) -> Self {
        Self::from_bits_retain(1 << sensor).intersection(Self::INTERRUPTS)
    }
}

/// Pending events of the task, settable from interrupt context.
pub(crate) struct TaskEvents {
    bits: AtomicU32,
    waker: AtomicWaker,
}

impl TaskEvents {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            waker: AtomicWaker::new(),
        }
    }

    /// Raises `events` and wakes the task.
    pub fn set(&self, events: Events) {
        self.bits.fetch_or(events.bits(), Ordering::AcqRel);
        self.waker.wake();
    }

    /// Reads and clears all pending events.
    pub fn take(&self) -> Events {
        Events::from_bits_retain(self.bits.swap(0, Ordering::AcqRel))
    }

    /// Waits until at least one event is pending, then reads and clears them all.
    pub async fn wait(&self) -> Events {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            let events = self.take();
            if events.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(events)
            }
        })
        .await
    }
}

/// Atomic set of sensor indices.
pub(crate) struct SensorMask(AtomicU32);

impl SensorMask {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn set(&self, sensor: usize) {
        self.set_mask(1 << sensor);
    }

    pub fn set_mask(&self, mask: u32) {
        self.0.fetch_or(mask, Ordering::AcqRel);
    }

    /// Clears the bit of `sensor` and returns whether it was set.
    pub fn take(&self, sensor: usize) -> bool {
        let bit = 1 << sensor;
        self.0.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn take_all(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// Iterates over the indices set in `mask`.
pub(crate) fn sensors_in(mask: u32) -> impl Iterator<Item = usize> {
    (0..MAX_MOTION_SENSORS).filter(move |i| mask & (1 << i) != 0)
}
