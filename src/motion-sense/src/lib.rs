//! Motion sensor orchestration for embedded controllers.
//!
//! A [`MotionSense`] instance owns a fixed table of [`Sensor`]s and is driven by a single
//! [`MotionTask`]. The task arbitrates the output data rate requested by the host and by the
//! controller for each power state, polls forced-mode sensors, drains interrupt-driven ones,
//! and queues samples into a FIFO the host reads through [`MotionSense::host_command()`].
//!
//! The platform is abstracted by the [`Port`] trait; power transitions are signaled with
//! [`MotionSense::on_startup()`], [`MotionSense::on_suspend()`], [`MotionSense::on_resume()`]
//! and [`MotionSense::on_shutdown()`].
//!
//! # Example
//!
//! ```ignore
//! static MOTION: StaticCell<MotionSense<'static, 2>> = StaticCell::new();
//!
//! let motion = MOTION.init(MotionSense::new(
//!     [Sensor::new(BASE_ACCEL, accel), Sensor::new(LID_ACCEL, lid)],
//!     Config::new().with_body_detection(BodyDetectionConfig::new(0)),
//! ));
//! motion.on_startup(&port, PowerState::Running);
//! MotionTask::new(motion, &port).run().await
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unused_must_use)]

pub mod body_detect;
pub mod config;
pub mod driver;
mod error;
mod events;
pub mod fifo;
pub mod host_cmd;
mod motion;
mod port;
mod power;
pub mod rate;
pub mod sensor;
mod task;

#[cfg(test)]
mod testing;

pub use body_detect::{BodyDetector, BodyState};
pub use config::{BodyDetectionConfig, Config};
pub use driver::{
    Activity, ActivityList, Driver, Harvest, HarvestedSample, Offset, Orientation, Scale,
};
pub use error::{Error, Status};
pub use events::Events;
pub use host_cmd::{Params, Response, SensorDescription, SpoofMode};
pub use motion::{fifo_timestamp, MotionSense, Sensor};
#[cfg(feature = "embassy-time-port")]
pub use port::EmbassyPort;
pub use port::{Deferred, Port};
pub use power::PowerState;
pub use sensor::{
    Location, PowerStates, RateRequest, RateTable, Requester, SensorInfo, SensorKind,
    SensorState, Vector,
};
pub use task::{Iteration, MotionTask};
