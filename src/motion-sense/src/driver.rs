use crate::{config::HARVEST_CAPACITY, Error, Events, Vector};

/// Gesture-class activities.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Activity {
    SigMotion = 1,
    DoubleTap = 2,
    Orientation = 3,
    BodyDetection = 4,
}

impl Activity {
    /// Bit of the activity in activity masks.
    #[must_use]
    pub const fn mask(self) -> u32 {
        1 << self as u8
    }
}

impl TryFrom<u8> for Activity {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::SigMotion),
            2 => Ok(Self::DoubleTap),
            3 => Ok(Self::Orientation),
            4 => Ok(Self::BodyDetection),
            _ => Err(Error::InvalidParam),
        }
    }
}

/// Screen orientation detected by a chip orientation engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Orientation {
    Landscape = 0,
    Portrait = 1,
    InvertedPortrait = 2,
    InvertedLandscape = 3,
    #[default]
    Unknown = 4,
}

/// Activities supported by a driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ActivityList {
    pub enabled: u32,
    pub disabled: u32,
}

/// Calibration offset, in driver counts, and the temperature it was taken at.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Offset {
    pub offset: [i16; 3],
    pub temperature: i16,
}

/// Calibration scale, in 1/32768 units, and the temperature it was taken at.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Scale {
    pub scale: [u16; 3],
    pub temperature: i16,
}

/// Hardware capabilities of a motion sensor.
///
/// Implementations talk to the hardware only; the subsystem owns every bookkeeping decision.
/// Optional capabilities default to [`Error::Unsupported`].
pub trait Driver {
    /// Resets and configures the chip.
    fn init(&mut self) -> Result<(), Error>;

    /// Reads one sample.
    fn read(&mut self) -> Result<Vector, Error>;

    /// Programs the range and returns the range actually applied.
    fn set_range(&mut self, range: i32, round_up: bool) -> Result<i32, Error>;

    /// Resolution of a sample, in bits.
    fn resolution(&self) -> u8;

    /// RMS noise, in µg.
    fn rms_noise(&self) -> u32 {
        0
    }

    /// Programs the output data rate, in mHz. 0 powers the sensor down.
    fn set_data_rate(&mut self, rate_mhz: u32, round_up: bool) -> Result<(), Error>;

    /// Output data rate actually in effect, in mHz.
    fn data_rate(&self) -> u32;

    fn set_offset(&mut self, _offset: Offset) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn offset(&self) -> Result<Offset, Error> {
        Err(Error::Unsupported)
    }

    fn set_scale(&mut self, _scale: Scale) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn scale(&self) -> Result<Scale, Error> {
        Err(Error::Unsupported)
    }

    /// Runs (or stops) the chip calibration and returns the resulting offset.
    fn perform_calib(&mut self, _enable: bool) -> Result<Offset, Error> {
        Err(Error::Unsupported)
    }

    /// Latest online calibration values, if the driver computes them.
    fn online_calibration(&self) -> Option<[i16; 3]> {
        None
    }

    /// Whether [`Driver::irq_handler()`] is implemented.
    fn has_irq_handler(&self) -> bool {
        false
    }

    /// Drains the chip after an interrupt.
    ///
    /// Runs outside the subsystem lock; samples go to `harvest` and are committed to the FIFO
    /// as one unit once the handler returns.
    fn irq_handler(&mut self, _harvest: &mut Harvest) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Orientation last detected by the chip.
    fn orientation(&self) -> Orientation {
        Orientation::Unknown
    }

    fn list_activities(&self) -> Result<ActivityList, Error> {
        Err(Error::Unsupported)
    }

    fn manage_activity(&mut self, _activity: Activity, _enable: bool) -> Result<(), Error> {
        Err(Error::Unsupported)
    }
}

/// One harvested sample.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HarvestedSample {
    pub xyz: Vector,
    pub timestamp: u32,
}

/// Samples collected by one interrupt handler run.
///
/// A frame reported invalid, a sample older than its predecessor, or a burst exceeding the
/// capacity closes the harvest: everything pushed afterwards is discarded, while samples accepted
/// before are kept.
pub struct Harvest {
    timestamp: u32,
    samples: heapless::Vec<HarvestedSample, HARVEST_CAPACITY>,
    raised: Events,
    discarded: usize,
    closed: bool,
}

impl Harvest {
    pub(crate) fn new(timestamp: u32) -> Self {
        Self {
            timestamp,
            samples: heapless::Vec::new(),
            raised: Events::empty(),
            discarded: 0,
            closed: false,
        }
    }

    /// Timestamp latched when the interrupt fired.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Adds a sample stamped with the interrupt timestamp.
    pub fn push(&mut self, xyz: Vector) -> Result<(), Error> {
        self.push_at(xyz, self.timestamp)
    }

    /// Adds a sample with its own timestamp.
    pub fn push_at(&mut self, xyz: Vector, timestamp: u32) -> Result<(), Error> {
        if self.closed {
            self.discarded += 1;
            return Err(Error::InvalidData);
        }
        let stale = self
            .samples
            .last()
            .is_some_and(|last| (timestamp.wrapping_sub(last.timestamp) as i32) < 0);
        if stale {
            self.close();
            return Err(Error::InvalidData);
        }
        if self
            .samples
            .push(HarvestedSample { xyz, timestamp })
            .is_err()
        {
            self.close();
            return Err(Error::InvalidData);
        }
        Ok(())
    }

    /// Reports a malformed frame; the rest of the harvest is discarded.
    pub fn invalidate(&mut self) {
        self.close();
    }

    /// Raises activity events detected by the chip.
    pub fn raise(&mut self, events: Events) {
        self.raised |= events.intersection(Events::SIG_MOTION | Events::DOUBLE_TAP);
    }

    #[must_use]
    pub fn samples(&self) -> &[HarvestedSample] {
        &self.samples
    }

    pub(crate) fn raised(&self) -> Events {
        self.raised
    }

    /// Number of samples rejected, including the one that closed the harvest.
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn close(&mut self) {
        self.closed = true;
        self.discarded += 1;
    }
}
