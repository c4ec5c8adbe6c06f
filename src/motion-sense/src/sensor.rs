use embassy_time::Instant;

use crate::PowerState;

/// Raw three-axis reading, in driver counts.
pub type Vector = [i32; 3];

/// Host-visible sensor type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SensorKind {
    Accel = 0,
    Gyro = 1,
    Mag = 2,
    Prox = 3,
    Light = 4,
    Activity = 5,
    Baro = 6,
    Sync = 7,
    LightRgb = 8,
}

/// Where the sensor sits in the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Location {
    Base = 0,
    Lid = 1,
    Camera = 2,
}

bitflags::bitflags! {
    /// Set of power states.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PowerStates: u8 {
        const RUNNING = 1 << 0;
        const SUSPENDED = 1 << 1;
        const OFF = 1 << 2;
    }
}

impl PowerStates {
    /// Running and suspended, the usual mask of an always-on sensor.
    pub const ON: Self = Self::RUNNING.union(Self::SUSPENDED);
}

/// Lifecycle state of a sensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorState {
    /// Not powered or never initialized.
    Uninitialized,
    /// Initialized, no rate programmed (or a zero rate).
    Initialized,
    /// Collecting at a non-zero rate.
    Ready,
    /// Initialization or rate programming failed repeatedly.
    InitError,
}

/// Party requesting a rate.
///
/// The host slot is arbitrated against the controller slot of the current power state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Requester {
    Host,
    Running,
    Suspended,
    Off,
}

impl Requester {
    const fn index(self) -> usize {
        match self {
            Self::Host => 0,
            Self::Running => 1,
            Self::Suspended => 2,
            Self::Off => 3,
        }
    }
}

impl From<PowerState> for Requester {
    fn from(power: PowerState) -> Self {
        match power {
            PowerState::Running => Self::Running,
            PowerState::Suspended => Self::Suspended,
            PowerState::Off => Self::Off,
        }
    }
}

/// Rate requested by one party.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RateRequest {
    /// Output data rate, in mHz. 0 turns the sensor off.
    pub odr_mhz: u32,
    /// Round to the next supported rate above rather than below.
    pub round_up: bool,
    /// Requested collection interval in microseconds, 0 when unset.
    pub ec_rate_us: u32,
}

impl RateRequest {
    #[must_use]
    pub const fn new(odr_mhz: u32, round_up: bool) -> Self {
        Self {
            odr_mhz,
            round_up,
            ec_rate_us: 0,
        }
    }

    #[must_use]
    pub const fn off() -> Self {
        Self::new(0, false)
    }
}

/// Rate requests of all parties for one sensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RateTable {
    slots: [RateRequest; 4],
}

impl RateTable {
    /// Returns a table where every party requests nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [RateRequest::off(); 4],
        }
    }

    /// Sets the request of `requester`, for use in board tables.
    // `Requester::index()` is always below 4.
    #[allow(clippy::indexing_slicing)]
    #[must_use]
    pub const fn with(mut self, requester: Requester, request: RateRequest) -> Self {
        self.slots[requester.index()] = request;
        self
    }

    #[must_use]
    pub fn get(&self, requester: Requester) -> RateRequest {
        self.slots
            .get(requester.index())
            .copied()
            .unwrap_or_default()
    }

    pub fn get_mut(&mut self, requester: Requester) -> Option<&mut RateRequest> {
        self.slots.get_mut(requester.index())
    }
}

/// Static description of a sensor, as found in a board table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SensorInfo {
    pub name: &'static str,
    pub kind: SensorKind,
    pub location: Location,
    /// Chip identifier reported to the host.
    pub chip: u8,
    /// Power states in which the sensor is powered.
    pub active_mask: PowerStates,
    /// Range applied at init and restored on shutdown.
    pub default_range: i32,
    /// Lowest supported rate in mHz.
    pub min_frequency: u32,
    /// Highest supported rate in mHz.
    pub max_frequency: u32,
    /// Whether the subsystem polls the sensor rather than waiting for its interrupt.
    pub forced_mode: bool,
    /// Controller-side rate requests, one per power state.
    pub default_config: RateTable,
}

impl SensorInfo {
    #[must_use]
    pub const fn new(name: &'static str, kind: SensorKind, location: Location) -> Self {
        Self {
            name,
            kind,
            location,
            chip: 0,
            active_mask: PowerStates::ON,
            default_range: 2,
            min_frequency: 0,
            max_frequency: 0,
            forced_mode: true,
            default_config: RateTable::new(),
        }
    }

    #[must_use]
    pub const fn with_chip(mut self, chip: u8) -> Self {
        self.chip = chip;
        self
    }

    #[must_use]
    pub const fn with_active_mask(mut self, mask: PowerStates) -> Self {
        self.active_mask = mask;
        self
    }

    #[must_use]
    pub const fn with_default_range(mut self, range: i32) -> Self {
        self.default_range = range;
        self
    }

    #[must_use]
    pub const fn with_frequencies(mut self, min_mhz: u32, max_mhz: u32) -> Self {
        self.min_frequency = min_mhz;
        self.max_frequency = max_mhz;
        self
    }

    /// Makes the sensor interrupt-driven instead of polled.
    #[must_use]
    pub const fn interrupt_driven(mut self) -> Self {
        self.forced_mode = false;
        self
    }

    #[must_use]
    pub const fn with_config(mut self, requester: Requester, request: RateRequest) -> Self {
        self.default_config = self.default_config.with(requester, request);
        self
    }
}

/// Mutable per-sensor state, kept under the subsystem lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SensorRuntime {
    pub state: SensorState,
    pub config: RateTable,
    pub current_range: i32,
    /// Collection period in microseconds. Non-zero exactly when the sensor is `Ready`.
    pub collection_rate: u64,
    pub next_collection: Instant,
    pub oversampling: u16,
    pub oversampling_ratio: u16,
    /// Latest reading, after spoofing.
    pub xyz: Vector,
    /// Latest reading from the driver.
    pub raw_xyz: Vector,
    pub spoof_xyz: Vector,
    pub spoofing: bool,
    pub read_failures: u32,
    pub rate_failures: u32,
}

impl SensorRuntime {
    pub fn new(info: &SensorInfo) -> Self {
        Self {
            state: SensorState::Uninitialized,
            config: info.default_config,
            current_range: info.default_range,
            collection_rate: 0,
            next_collection: Instant::from_ticks(0),
            oversampling: 0,
            oversampling_ratio: 0,
            xyz: [0; 3],
            raw_xyz: [0; 3],
            spoof_xyz: [0; 3],
            spoofing: false,
            read_failures: 0,
            rate_failures: 0,
        }
    }

    pub fn mark_failed(&mut self) {
        self.collection_rate = 0;
        self.state = SensorState::InitError;
    }

    /// Whether a forced-mode collection is due, allowing `min_interval` of early slack.
    pub fn time_to_read(&self, now: Instant, min_interval: embassy_time::Duration) -> bool {
        self.collection_rate != 0 && now + min_interval > self.next_collection
    }

    /// Advances the collection deadline by one period.
    ///
    /// Returns the number of whole periods missed when the deadline already lies in the past; the
    /// deadline then restarts from `now`.
    pub fn advance_collection(
        &mut self,
        now: Instant,
        min_interval: embassy_time::Duration,
    ) -> u64 {
        let period = embassy_time::Duration::from_micros(self.collection_rate);
        self.next_collection += period;
        if now > self.next_collection {
            let missed = (now - self.next_collection).as_micros() / self.collection_rate.max(1);
            self.next_collection = now + min_interval;
            missed
        } else {
            0
        }
    }

    /// Returns whether the oversampling filter keeps the current sample.
    pub fn keep_sample(&mut self) -> bool {
        if self.oversampling_ratio == 0 {
            return false;
        }
        let keep = self.oversampling == 0;
        self.oversampling = (self.oversampling + 1) % self.oversampling_ratio;
        keep
    }
}
