//! Host command surface.
//!
//! Commands arrive already decoded from the host transport; variable-length results (sensor
//! dumps and FIFO reads) are encoded into the caller's payload buffer.

use crate::{
    body_detect::BodyState,
    driver::{Activity, ActivityList, Offset, Scale},
    fifo::{clamp_i16, FifoInfo},
    sensor::{Location, Requester, SensorKind, SensorState},
    MotionSense, Sensor, Status,
};

/// Value of a setter argument asking only for the current value.
pub const NO_VALUE: i32 = -1;

/// Module flag reported by [`Params::Dump`]: the subsystem is running.
pub const MODULE_FLAG_ACTIVE: u8 = 1 << 0;

/// Sensor flag reported by [`Params::Dump`]: the sensor is present.
pub const SENSOR_FLAG_PRESENT: u8 = 1 << 0;

/// Size of one sensor record of a dump, in bytes.
pub const DUMP_ENTRY_SIZE: usize = 8;

/// Spoofing sub-command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpoofMode {
    Disable,
    /// Report the given values instead of the measured ones.
    Custom {
        components: [i16; 3],
        activity_state: u8,
    },
    /// Freeze the reported values at the current ones.
    LockCurrent,
    Query,
}

/// A decoded host command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Params {
    Dump { max_sensor_count: u8 },
    Info { sensor_num: u8 },
    Data { sensor_num: u8 },
    /// Collection interval in ms, or [`NO_VALUE`].
    EcRate { sensor_num: u8, data: i32 },
    /// Output data rate in mHz, or [`NO_VALUE`].
    SensorOdr { sensor_num: u8, data: i32, round_up: bool },
    /// Range in g (or sensor units), or [`NO_VALUE`].
    SensorRange { sensor_num: u8, data: i32, round_up: bool },
    SensorOffset { sensor_num: u8, set: Option<Offset> },
    SensorScale { sensor_num: u8, set: Option<Scale> },
    PerformCalib { sensor_num: u8, enable: bool },
    FifoFlush { sensor_num: u8 },
    FifoInfo,
    FifoRead { max_data_vector: u32 },
    /// 0, 1, or [`NO_VALUE`].
    FifoIntEnable { enable: i32 },
    OnlineCalibRead { sensor_num: u8 },
    ListActivities,
    SetActivity { activity: u8, enable: bool },
    GetActivity { activity: u8 },
    /// `activity` is only used when `sensor_num` is the activity pseudo-sensor.
    Spoof { sensor_num: u8, activity: u8, mode: SpoofMode },
}

/// Sensor description returned by [`Params::Info`].
///
/// Fields introduced by later command versions are `None` for older versions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorDescription {
    pub kind: SensorKind,
    pub location: Location,
    pub chip: u8,
    pub min_frequency: Option<u32>,
    pub max_frequency: Option<u32>,
    pub fifo_max_event_count: Option<u16>,
    pub online_calib: Option<bool>,
}

/// Successful host command result.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response<const N: usize> {
    /// `reported` records of [`DUMP_ENTRY_SIZE`] bytes were written to the payload.
    Dump {
        module_flags: u8,
        sensor_count: u8,
        reported: usize,
    },
    Info(SensorDescription),
    Data([i16; 3]),
    /// Collection interval in ms.
    EcRate(i32),
    /// Output data rate in mHz.
    SensorOdr(i32),
    SensorRange(i32),
    SensorOffset(Offset),
    SensorScale(Scale),
    PerformCalib(Offset),
    FifoInfo(FifoInfo<N>),
    /// `number_data` entries of [`ENTRY_SIZE`](crate::fifo::ENTRY_SIZE) bytes were written to the
    /// payload.
    FifoRead { number_data: usize },
    FifoIntEnable(bool),
    OnlineCalib(Option<[i16; 3]>),
    ListActivities(ActivityList),
    SetActivity,
    GetActivity(u8),
    /// Spoofing status, reported for [`SpoofMode::Query`] only.
    Spoof(Option<bool>),
}

impl<'d, const N: usize, const F: usize> MotionSense<'d, N, F> {
    /// Handles one host command.
    pub async fn host_command(
        &self,
        version: u8,
        params: Params,
        payload: &mut [u8],
    ) -> Result<Response<N>, Status> {
        motion_sense_log::trace!("motion sense: host command {:?}", params);
        match params {
            Params::Dump { max_sensor_count } => Ok(self.dump(max_sensor_count, payload)),
            Params::Info { sensor_num } => self.describe(version, sensor_num).await,
            Params::Data { sensor_num } => {
                let i = self.host_sensor(sensor_num)?;
                let xyz = self.last_reading(i).ok_or(Status::InvalidParam)?;
                Ok(Response::Data(xyz.map(clamp_i16)))
            }
            Params::EcRate { sensor_num, data } => self.ec_rate(sensor_num, data),
            Params::SensorOdr {
                sensor_num,
                data,
                round_up,
            } => self.sensor_odr(sensor_num, data, round_up).await,
            Params::SensorRange {
                sensor_num,
                data,
                round_up,
            } => self.sensor_range(sensor_num, data, round_up).await,
            Params::SensorOffset { sensor_num, set } => {
                let mut driver = self.host_driver(sensor_num)?.driver.lock().await;
                if let Some(offset) = set {
                    driver.set_offset(offset)?;
                }
                Ok(Response::SensorOffset(driver.offset()?))
            }
            Params::SensorScale { sensor_num, set } => {
                let mut driver = self.host_driver(sensor_num)?.driver.lock().await;
                if let Some(scale) = set {
                    driver.set_scale(scale)?;
                }
                Ok(Response::SensorScale(driver.scale()?))
            }
            Params::PerformCalib { sensor_num, enable } => {
                let mut driver = self.host_driver(sensor_num)?.driver.lock().await;
                Ok(Response::PerformCalib(driver.perform_calib(enable)?))
            }
            Params::FifoFlush { sensor_num } => {
                let i = self.host_sensor(sensor_num)?;
                self.request_flush(i);
                Ok(Response::FifoInfo(self.with_shared(|s| s.fifo.info(true))))
            }
            Params::FifoInfo => Ok(Response::FifoInfo(self.with_shared(|s| s.fifo.info(true)))),
            Params::FifoRead { max_data_vector } => {
                let max = usize::try_from(max_data_vector).unwrap_or(usize::MAX);
                let number_data = self.with_shared(|s| s.fifo.read_into(payload, max));
                Ok(Response::FifoRead { number_data })
            }
            Params::FifoIntEnable { enable } => {
                let enable = match enable {
                    0 => Some(false),
                    1 => Some(true),
                    NO_VALUE => None,
                    _ => return Err(Status::InvalidParam),
                };
                let enabled = self.with_shared(|s| {
                    if let Some(enable) = enable {
                        s.fifo_int_enabled = enable;
                    }
                    s.fifo_int_enabled
                });
                Ok(Response::FifoIntEnable(enabled))
            }
            Params::OnlineCalibRead { sensor_num } => {
                let driver = self.host_driver(sensor_num)?.driver.lock().await;
                Ok(Response::OnlineCalib(driver.online_calibration()))
            }
            Params::ListActivities => self.list_activities().await,
            Params::SetActivity { activity, enable } => self.set_activity(activity, enable).await,
            Params::GetActivity { activity } => {
                self.gestures_available()?;
                match (Activity::try_from(activity), self.body_state()) {
                    (Ok(Activity::BodyDetection), Some(state)) => {
                        Ok(Response::GetActivity(state as u8))
                    }
                    _ => Err(Status::InvalidParam),
                }
            }
            Params::Spoof {
                sensor_num,
                activity,
                mode,
            } => {
                if self.config.host_gestures && usize::from(sensor_num) == N {
                    self.spoof_activity(activity, mode)
                } else {
                    self.spoof_sensor(sensor_num, mode)
                }
            }
        }
    }

    /// Maps a host id to a powered, initialized sensor.
    fn host_sensor(&self, sensor_num: u8) -> Result<usize, Status> {
        let i = usize::from(sensor_num);
        let usable = matches!(
            self.sensor_state(i),
            Some(SensorState::Initialized | SensorState::Ready)
        );
        if usable && self.is_active(i) {
            Ok(i)
        } else {
            Err(Status::InvalidParam)
        }
    }

    /// Like [`Self::host_sensor()`], also mapping the activity pseudo-sensor to the first
    /// gesture sensor.
    fn host_motion_sensor(&self, sensor_num: u8) -> Result<usize, Status> {
        if self.config.host_gestures && usize::from(sensor_num) == N {
            let first = self.config.gesture_sensors.trailing_zeros();
            let first = u8::try_from(first).map_err(|_| Status::InvalidParam)?;
            return self.host_sensor(first);
        }
        self.host_sensor(sensor_num)
    }

    fn host_driver(&self, sensor_num: u8) -> Result<&Sensor<'d>, Status> {
        let i = self.host_sensor(sensor_num)?;
        self.sensors.get(i).ok_or(Status::InvalidParam)
    }

    fn gestures_available(&self) -> Result<(), Status> {
        if self.config.host_gestures {
            Ok(())
        } else {
            Err(Status::Unavailable)
        }
    }

    fn dump(&self, max_sensor_count: u8, payload: &mut [u8]) -> Response<N> {
        let all = N + usize::from(self.config.host_gestures);
        let readings = self.with_shared(|s| s.sensors.each_ref().map(|rt| rt.xyz));
        let mut reported = 0;
        for (i, record) in payload
            .chunks_exact_mut(DUMP_ENTRY_SIZE)
            .take(all.min(usize::from(max_sensor_count)))
            .enumerate()
        {
            record.fill(0);
            let (header, data) = record.split_at_mut(2);
            header.copy_from_slice(&[SENSOR_FLAG_PRESENT, 0]);
            if let Some(xyz) = readings.get(i) {
                for (chunk, value) in data.chunks_exact_mut(2).zip(xyz) {
                    chunk.copy_from_slice(&clamp_i16(*value).to_le_bytes());
                }
            }
            reported += 1;
        }
        Response::Dump {
            module_flags: MODULE_FLAG_ACTIVE,
            sensor_count: u8::try_from(all).unwrap_or(u8::MAX),
            reported,
        }
    }

    async fn describe(&self, version: u8, sensor_num: u8) -> Result<Response<N>, Status> {
        let i = self.host_motion_sensor(sensor_num)?;
        let info = self.info(i).ok_or(Status::InvalidParam)?;
        let kind = if self.config.host_gestures && usize::from(sensor_num) == N {
            SensorKind::Activity
        } else {
            info.kind
        };

        let mut description = SensorDescription {
            kind,
            location: info.location,
            chip: info.chip,
            min_frequency: None,
            max_frequency: None,
            fifo_max_event_count: None,
            online_calib: None,
        };
        if version >= 3 {
            description.min_frequency = Some(info.min_frequency);
            description.max_frequency = Some(info.max_frequency);
            description.fifo_max_event_count = Some(u16::try_from(F).unwrap_or(u16::MAX));
        }
        if version >= 4 {
            let sensor = self.sensors.get(i).ok_or(Status::InvalidParam)?;
            let driver = sensor.driver.lock().await;
            description.online_calib = Some(driver.online_calibration().is_some());
        }
        Ok(Response::Info(description))
    }

    fn ec_rate(&self, sensor_num: u8, data: i32) -> Result<Response<N>, Status> {
        let i = self.host_sensor(sensor_num)?;
        let min_interval = u32::try_from(self.config.min_interval.as_micros()).unwrap_or(u32::MAX);
        let rate_us = self.with_shared(|s| {
            let host = s.sensors.get_mut(i)?.config.get_mut(Requester::Host)?;
            if data != NO_VALUE {
                let rate_us = u32::try_from(data).ok()?.saturating_mul(1000);
                host.ec_rate_us = if rate_us > 0 {
                    rate_us.max(min_interval)
                } else {
                    0
                };
            }
            Some(host.ec_rate_us)
        });
        let rate_us = rate_us.ok_or(Status::InvalidParam)?;
        if data != NO_VALUE {
            // Force a collection to purge old events.
            self.events.set(crate::Events::ODR_CHANGE);
        }
        Ok(Response::EcRate(i32::try_from(rate_us / 1000).unwrap_or(i32::MAX)))
    }

    async fn sensor_odr(
        &self,
        sensor_num: u8,
        data: i32,
        round_up: bool,
    ) -> Result<Response<N>, Status> {
        let i = self.host_sensor(sensor_num)?;
        if data != NO_VALUE {
            let odr_mhz = u32::try_from(data).map_err(|_| Status::InvalidParam)?;
            self.with_shared(|s| {
                let host = s
                    .sensors
                    .get_mut(i)
                    .and_then(|rt| rt.config.get_mut(Requester::Host));
                if let Some(host) = host {
                    host.odr_mhz = odr_mhz;
                    host.round_up = round_up;
                }
            });
            motion_sense_log::debug!("sensor {}: host odr {} mHz", i, odr_mhz);
            // The new rate may stop the sensor; the task flushes it with an odr event.
            self.request_odr(i);
        }
        let driver = self.host_driver(sensor_num)?.driver.lock().await;
        Ok(Response::SensorOdr(
            i32::try_from(driver.data_rate()).unwrap_or(i32::MAX),
        ))
    }

    async fn sensor_range(
        &self,
        sensor_num: u8,
        data: i32,
        round_up: bool,
    ) -> Result<Response<N>, Status> {
        let i = self.host_sensor(sensor_num)?;
        if data != NO_VALUE {
            let mut driver = self.host_driver(sensor_num)?.driver.lock().await;
            let range = driver
                .set_range(data, round_up)
                .map_err(|err| match err {
                    crate::Error::Unsupported => Status::InvalidCommand,
                    _ => Status::InvalidParam,
                })?;
            self.with_shared(|s| {
                if let Some(rt) = s.sensors.get_mut(i) {
                    rt.current_range = range;
                }
            });
        }
        let range = self.with_shared(|s| s.sensors.get(i).map(|rt| rt.current_range));
        range.map(Response::SensorRange).ok_or(Status::InvalidParam)
    }

    async fn list_activities(&self) -> Result<Response<N>, Status> {
        self.gestures_available()?;
        let mut list = ActivityList::default();
        for i in crate::events::sensors_in(self.config.gesture_sensors) {
            let Some(sensor) = self.sensors.get(i) else {
                continue;
            };
            let activities = sensor.driver.lock().await.list_activities()?;
            list.enabled |= activities.enabled;
            list.disabled |= activities.disabled;
        }
        let body_enabled = self.with_shared(|s| s.body.as_ref().map(|body| body.enabled()));
        match body_enabled {
            Some(true) => list.enabled |= Activity::BodyDetection.mask(),
            Some(false) => list.disabled |= Activity::BodyDetection.mask(),
            None => {}
        }
        Ok(Response::ListActivities(list))
    }

    async fn set_activity(&self, activity: u8, enable: bool) -> Result<Response<N>, Status> {
        self.gestures_available()?;
        let activity = Activity::try_from(activity)?;
        let mut result = Ok(());
        for i in crate::events::sensors_in(self.config.gesture_sensors) {
            let Some(sensor) = self.sensors.get(i) else {
                continue;
            };
            let mut driver = sensor.driver.lock().await;
            let Ok(list) = driver.list_activities() else {
                continue;
            };
            if (list.enabled | list.disabled) & activity.mask() != 0 {
                result = driver.manage_activity(activity, enable);
                if result.is_err() {
                    break;
                }
            }
        }
        if activity == Activity::BodyDetection {
            self.with_shared(|s| {
                if let Some(body) = s.body.as_mut() {
                    body.set_enabled(enable);
                }
            });
        }
        result?;
        Ok(Response::SetActivity)
    }

    fn spoof_sensor(&self, sensor_num: u8, mode: SpoofMode) -> Result<Response<N>, Status> {
        let i = self.host_sensor(sensor_num)?;
        let status = self.with_shared(|s| {
            let rt = s.sensors.get_mut(i)?;
            match mode {
                SpoofMode::Disable => rt.spoofing = false,
                SpoofMode::Custom { components, .. } => {
                    rt.spoof_xyz = components.map(i32::from);
                    rt.spoofing = true;
                }
                SpoofMode::LockCurrent => {
                    rt.spoof_xyz = rt.raw_xyz;
                    rt.spoofing = true;
                }
                SpoofMode::Query => return Some(Some(rt.spoofing)),
            }
            Some(None)
        });
        let status = status.ok_or(Status::InvalidParam)?;
        if status.is_none() {
            motion_sense_log::info!("sensor {}: spoof {:?}", i, mode);
        }
        Ok(Response::Spoof(status))
    }

    fn spoof_activity(&self, activity: u8, mode: SpoofMode) -> Result<Response<N>, Status> {
        if Activity::try_from(activity) != Ok(Activity::BodyDetection) {
            return Err(Status::InvalidParam);
        }
        let status = self.with_shared(|s| {
            let timestamp = s.last_timestamp;
            let body = s.body.as_mut()?;
            let mut change = None;
            let status = match mode {
                SpoofMode::Disable => {
                    body.lock_current(false);
                    None
                }
                SpoofMode::Custom { activity_state, .. } => {
                    let state = BodyState::try_from(activity_state).ok()?;
                    change = body.spoof(state);
                    None
                }
                SpoofMode::LockCurrent => {
                    body.lock_current(true);
                    None
                }
                SpoofMode::Query => Some(body.spoofing()),
            };
            if let Some(state) = change {
                s.stage_activity(Activity::BodyDetection, state as u8, timestamp);
                s.fifo.commit();
            }
            Some(status)
        });
        status.map(Response::Spoof).ok_or(Status::InvalidParam)
    }
}
