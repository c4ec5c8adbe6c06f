use embassy_time::Duration;

use crate::{
    port::{Deferred, Port},
    sensor::{PowerStates, SensorState},
    Events, MotionSense,
};

/// System power state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PowerState {
    Running = 0,
    Suspended = 1,
    Off = 2,
}

impl PowerState {
    #[must_use]
    pub const fn mask(self) -> PowerStates {
        match self {
            Self::Running => PowerStates::RUNNING,
            Self::Suspended => PowerStates::SUSPENDED,
            Self::Off => PowerStates::OFF,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Suspended,
            _ => Self::Off,
        }
    }
}

impl<const N: usize, const F: usize> MotionSense<'_, N, F> {
    /// Brings the subsystem up in `power`, as at boot.
    pub fn on_startup<P: Port>(&self, port: &P, power: PowerState) {
        self.on_shutdown(port);
        match power {
            PowerState::Off => {}
            PowerState::Suspended => self.enter_suspend(port),
            PowerState::Running => self.on_resume(port),
        }
    }

    /// The system is powering off: host requests are dropped and ranges restored.
    pub fn on_shutdown<P: Port>(&self, port: &P) {
        self.set_power_state(PowerState::Off);
        self.with_shared(|s| {
            for (rt, sensor) in s.sensors.iter_mut().zip(&self.sensors) {
                if let Some(host) = rt.config.get_mut(crate::Requester::Host) {
                    host.odr_mhz = 0;
                    host.ec_rate_us = 0;
                }
                rt.current_range = sensor.info.default_range;
            }
        });
        motion_sense_log::info!("motion sense: shutdown");
        port.call_deferred(Deferred::SwitchSensorRate, Duration::from_ticks(0));
    }

    pub fn on_suspend<P: Port>(&self, port: &P) {
        // Coming from off, the system goes on to running right away.
        if self.power_state() == PowerState::Off {
            return;
        }
        self.enter_suspend(port);
    }

    fn enter_suspend<P: Port>(&self, port: &P) {
        self.set_power_state(PowerState::Suspended);
        motion_sense_log::info!("motion sense: suspend");
        port.call_deferred(Deferred::SwitchSensorRate, self.config.suspend_delay);
    }

    pub fn on_resume<P: Port>(&self, port: &P) {
        self.set_power_state(PowerState::Running);
        motion_sense_log::info!("motion sense: resume");
        port.call_deferred(Deferred::SwitchSensorRate, self.config.resume_delay);
    }

    /// Runs work scheduled through [`Port::call_deferred()`].
    pub fn run_deferred(&self, work: Deferred) {
        match work {
            Deferred::SwitchSensorRate => self.switch_sensor_rate(),
        }
    }

    /// Applies the current power state to every sensor.
    ///
    /// Sensors powered in this state are queued for setup by the task; the others lose their
    /// configuration, as their supply is cut.
    fn switch_sensor_rate(&self) {
        let power = self.power_state();
        let mut setup = 0u32;
        self.with_shared(|s| {
            for (i, (rt, sensor)) in s.sensors.iter_mut().zip(&self.sensors).enumerate() {
                if sensor.info.active_mask.contains(power.mask()) {
                    setup |= 1 << i;
                } else if matches!(rt.state, SensorState::Initialized | SensorState::Ready) {
                    rt.collection_rate = 0;
                    rt.state = SensorState::Uninitialized;
                    rt.read_failures = 0;
                    rt.rate_failures = 0;
                }
            }

            let always_on = self
                .config
                .body_detection
                .is_some_and(|body| body.always_enable_in_s0);
            if let Some(body) = s.body.as_mut() {
                match power {
                    PowerState::Suspended => {
                        s.body_was_enabled = body.enabled();
                        body.set_enabled(false);
                    }
                    PowerState::Running => {
                        if always_on || s.body_was_enabled {
                            body.set_enabled(true);
                        }
                    }
                    PowerState::Off => {}
                }
            }
        });

        motion_sense_log::debug!("motion sense: power {:?}, setup {}", power, setup);
        self.setup_pending.set_mask(setup);
        let mut events = Events::SETUP;
        if power == PowerState::Off && self.config.host_gestures {
            events |= Events::FORGET_ACTIVITIES;
        }
        self.events.set(events);
    }
}
