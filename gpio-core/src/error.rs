//! Error kinds shared by every operation in the core: GPIO line claims,
//! transmission, bus adapters, scripts and (once encoded onto the wire
//! by `gpiod`) client-visible status codes.

use std::fmt;

/// Mirrors the historical small-negative-integer error codes of the C
/// library this system replaces: `status = -(kind as i32 + 1)`, `0` = ok.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorKind {
    BadHandle,
    BadFlags,
    CannotOpenChip,
    GpioInUse,
    BadGpio,
    BadPulseWidth,
    BadPwmDuty,
    BadPwmFreq,
    BadServoFreq,
    BadServoWidth,
    BadTxType,
    BadDebounceMics,
    BadWatchdogMics,
    BadI2cAddr,
    BadI2cFlags,
    BadI2cBus,
    BadI2cParam,
    BadSpiCount,
    BadSerialSpeed,
    BadSerialFlags,
    BadSerialParam,
    BadPointer,
    NoFileMatch,
    NoFileAccess,
    BadFileMode,
    FileOpenFailed,
    BadFileSeek,
    BadFileParam,
    NoPermission,
    NotInScript,
    ScriptFailed,
    BadScript,
    I2cOpenFailed,
    SpiOpenFailed,
    SerialOpenFailed,
    Timeout,
    NoMemory,
    DeviceFaulted,
}

impl ErrorKind {
    /// The wire-protocol status code: a small negative integer, `-1` for
    /// the first variant onward, so `0` is always free to mean success.
    pub fn status_code(self) -> i32 {
        -(self as i32) - 1
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<gpio_uapi::Error> for Error {
    fn from(e: gpio_uapi::Error) -> Self {
        let kind = match &e {
            gpio_uapi::Error::Ioctl { source, .. } if is_device_lost(source) => {
                ErrorKind::DeviceFaulted
            }
            gpio_uapi::Error::Ioctl { .. } => ErrorKind::BadGpio,
        };
        Error::with_source(kind, "gpio ioctl failed", e)
    }
}

fn is_device_lost(e: &nix::Error) -> bool {
    matches!(e, nix::Error::ENODEV | nix::Error::ENXIO | nix::Error::EBADF)
}

pub type Result<T> = std::result::Result<T, Error>;
