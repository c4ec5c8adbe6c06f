/// Errors reported by sensor drivers and by the subsystem itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The bus transaction with the sensor failed.
    Bus,
    /// The sensor is not initialized or not ready for this operation.
    NotReady,
    /// A parameter is out of range.
    InvalidParam,
    /// The operation is not supported by this sensor.
    Unsupported,
    /// The sensor is busy, try again later.
    Busy,
    /// Initialization failed after all retries.
    InitFailed,
    /// The sensor returned malformed or stale data.
    InvalidData,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Bus => write!(f, "bus error while accessing the sensor"),
            Self::NotReady => write!(f, "sensor is not ready"),
            Self::InvalidParam => write!(f, "invalid parameter"),
            Self::Unsupported => write!(f, "operation not supported by the sensor"),
            Self::Busy => write!(f, "sensor is busy"),
            Self::InitFailed => write!(f, "sensor initialization failed"),
            Self::InvalidData => write!(f, "sensor returned invalid data"),
        }
    }
}

impl core::error::Error for Error {}

/// Status returned to the host for a rejected command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// The command or sub-command is not known or not supported by the sensor.
    InvalidCommand,
    /// A parameter was out of range, or the sensor is not usable.
    InvalidParam,
    /// The driver failed to carry out the command.
    Error,
    /// The driver is busy, the host should retry.
    Busy,
    /// The requested feature is not present on this board.
    Unavailable,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Unsupported => Self::InvalidCommand,
            Error::InvalidParam | Error::NotReady => Self::InvalidParam,
            Error::Busy => Self::Busy,
            Error::Bus | Error::InitFailed | Error::InvalidData => Self::Error,
        }
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::InvalidParam => write!(f, "invalid parameter"),
            Self::Error => write!(f, "command failed"),
            Self::Busy => write!(f, "busy"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

impl core::error::Error for Status {}
