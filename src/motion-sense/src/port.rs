use core::future::Future;

use embassy_time::{Duration, Instant};

/// Work deferred by the power hooks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Deferred {
    /// Re-evaluate which sensors are powered and reconfigure them.
    SwitchSensorRate,
}

/// Services the subsystem needs from the platform.
pub trait Port {
    /// Current time.
    fn now(&self) -> Instant;

    /// Waits for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()>;

    /// Runs `work` after `delay`, through
    /// [`MotionSense::run_deferred()`](crate::MotionSense::run_deferred).
    ///
    /// Scheduling the same work again before it ran replaces the pending request.
    fn call_deferred(&self, work: Deferred, delay: Duration);

    /// Raises the host interrupt line.
    fn notify_host(&self);
}

#[cfg(feature = "embassy-time-port")]
pub use embassy_port::EmbassyPort;

#[cfg(feature = "embassy-time-port")]
mod embassy_port {
    use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
    use embassy_time::{Duration, Instant, Timer};

    use super::{Deferred, Port};
    use crate::MotionSense;

    /// [`Port`] backed by the `embassy-time` timer queue.
    pub struct EmbassyPort<H> {
        deferred: Signal<CriticalSectionRawMutex, (Deferred, Duration)>,
        notify: H,
    }

    impl<H: Fn()> EmbassyPort<H> {
        /// Creates a port raising host notifications with `notify`.
        pub const fn new(notify: H) -> Self {
            Self {
                deferred: Signal::new(),
                notify,
            }
        }

        /// Runs deferred work; must be spawned next to the motion sense task.
        pub async fn run_deferred<const N: usize, const F: usize>(
            &self,
            motion: &MotionSense<'_, N, F>,
        ) -> ! {
            loop {
                let (work, delay) = self.deferred.wait().await;
                Timer::after(delay).await;
                motion.run_deferred(work);
            }
        }
    }

    impl<H: Fn()> Port for EmbassyPort<H> {
        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep(&self, duration: Duration) -> impl core::future::Future<Output = ()> {
            Timer::after(duration)
        }

        fn call_deferred(&self, work: Deferred, delay: Duration) {
            self.deferred.signal((work, delay));
        }

        fn notify_host(&self) {
            (self.notify)();
        }
    }
}
