//! Rate arbitration between the host and the controller.

use embassy_time::{Duration, Instant};

use crate::{
    sensor::{RateRequest, RateTable, Requester, SensorState},
    Driver, Error, MotionSense, PowerState,
};

/// Outcome of the arbitration for one sensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Resolution {
    pub odr_mhz: u32,
    pub round_up: bool,
    /// The request that won.
    pub requester: Requester,
}

/// Picks the effective rate of a sensor in `power`.
///
/// The controller request of the current power state wins only when strictly faster than the
/// host request; the host request is ignored while the system is off.
#[must_use]
pub fn resolve(config: &RateTable, power: PowerState) -> Resolution {
    let controller = config.get(power.into());
    let host = if power == PowerState::Off {
        RateRequest::off()
    } else {
        config.get(Requester::Host)
    };

    if power == PowerState::Off || controller.odr_mhz > host.odr_mhz {
        Resolution {
            odr_mhz: controller.odr_mhz,
            round_up: controller.round_up,
            requester: power.into(),
        }
    } else {
        Resolution {
            odr_mhz: host.odr_mhz,
            round_up: host.round_up,
            requester: Requester::Host,
        }
    }
}

/// Collection period at `odr_mhz`, in microseconds; 0 for a zero rate.
#[must_use]
pub const fn period_us(odr_mhz: u32) -> u64 {
    if odr_mhz == 0 {
        0
    } else {
        1_000_000_000 / odr_mhz as u64
    }
}

/// How many hardware samples make one host sample; 0 when the host wants none.
#[must_use]
pub fn oversampling_ratio(actual_mhz: u32, host_mhz: u32) -> u16 {
    if host_mhz == 0 {
        return 0;
    }
    u16::try_from((actual_mhz / host_mhz).max(1)).unwrap_or(u16::MAX)
}

impl<const N: usize, const F: usize> MotionSense<'_, N, F> {
    /// Programs the arbitrated rate of `sensor` and updates its schedule.
    ///
    /// The bookkeeping changes together with the hardware: on failure the sensor keeps its
    /// previous schedule and the request is retried by the task, up to the configured limit.
    /// A sensor powered down while the rate was being programmed stays down.
    /// Returns the rate in effect.
    pub(crate) fn program_rate(
        &self,
        sensor: usize,
        driver: &mut dyn Driver,
        now: Instant,
    ) -> Result<u32, Error> {
        let power = self.power_state();
        let (resolution, host_mhz) = self
            .with_shared(|s| {
                s.sensors.get(sensor).map(|rt| {
                    let host = if power == PowerState::Off {
                        0
                    } else {
                        rt.config.get(Requester::Host).odr_mhz
                    };
                    (resolve(&rt.config, power), host)
                })
            })
            .ok_or(Error::InvalidParam)?;

        if let Err(err) = driver.set_data_rate(resolution.odr_mhz, resolution.round_up) {
            self.record_rate_failure(sensor, err);
            return Err(err);
        }
        let actual = driver.data_rate();
        let resolution_bits = driver.resolution();
        let rms_noise = driver.rms_noise();
        let body_sensor = self.config.body_detection.map(|body| body.sensor);
        let active = self.is_active(sensor);

        // The power state may have changed while the bus was busy.
        let applied = self.with_shared(|s| {
            let Some(rt) = s.sensors.get_mut(sensor) else {
                return false;
            };
            if !active || !matches!(rt.state, SensorState::Initialized | SensorState::Ready) {
                return false;
            }
            let period = period_us(actual);
            rt.collection_rate = period;
            rt.next_collection = now + Duration::from_micros(period);
            rt.oversampling = 0;
            rt.oversampling_ratio = oversampling_ratio(actual, host_mhz);
            rt.rate_failures = 0;
            rt.state = if actual > 0 {
                SensorState::Ready
            } else {
                SensorState::Initialized
            };
            let range = rt.current_range;
            s.fifo
                .set_data_period(sensor, u32::try_from(period).unwrap_or(u32::MAX));

            if body_sensor == Some(sensor) {
                if let Some(body) = s.body.as_mut() {
                    body.reset(actual, range, resolution_bits, rms_noise);
                }
            }
            true
        });
        if !applied {
            motion_sense_log::debug!(
                "sensor {}: odr {} mHz dropped, sensor powered down",
                sensor,
                actual
            );
            return Err(Error::NotReady);
        }

        motion_sense_log::info!(
            "sensor {}: odr {} mHz (requested {} by {:?})",
            sensor,
            actual,
            resolution.odr_mhz,
            resolution.requester
        );
        Ok(actual)
    }

    fn record_rate_failure(&self, sensor: usize, err: Error) {
        let max_retries = self.config.max_retries;
        let retry = self.with_shared(|s| {
            let rt = s.sensors.get_mut(sensor)?;
            rt.rate_failures += 1;
            if rt.rate_failures >= max_retries {
                rt.mark_failed();
                Some(false)
            } else {
                Some(true)
            }
        });
        match retry {
            Some(true) => {
                motion_sense_log::warn!("sensor {}: setting odr failed ({:?})", sensor, err);
                self.request_odr(sensor);
            }
            Some(false) => {
                motion_sense_log::error!(
                    "sensor {}: setting odr failed ({:?}), giving up",
                    sensor,
                    err
                );
            }
            None => {}
        }
    }
}
