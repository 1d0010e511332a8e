//! Serial (tty) device adapter: opens a `/dev/tty*` path and configures
//! it as a raw byte pipe at one of the fixed baud rates from §4.6, via
//! `nix`'s termios bindings (already part of the workspace's dependency
//! stack through `nix`'s default features).

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    os::fd::AsFd,
};

use nix::sys::termios::{self, BaudRate, SetArg};

use crate::error::{Error, ErrorKind, Result};

pub const ALLOWED_SPEEDS: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115200, 230400,
];

pub struct SerialDevice {
    file: File,
}

impl SerialDevice {
    pub fn open(path: impl AsRef<std::path::Path>, speed: u32, flags: u32) -> Result<Self> {
        if flags != 0 {
            return Err(Error::new(ErrorKind::BadSerialFlags, "flags must be 0"));
        }
        if !ALLOWED_SPEEDS.contains(&speed) {
            return Err(Error::new(ErrorKind::BadSerialSpeed, format!("{speed} is not a standard baud rate")));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| Error::with_source(ErrorKind::SerialOpenFailed, "opening tty", e))?;

        let mut tio = termios::tcgetattr(file.as_fd())
            .map_err(|e| Error::with_source(ErrorKind::SerialOpenFailed, "reading termios", e))?;
        termios::cfmakeraw(&mut tio);
        let baud = speed_to_baud_rate(speed)?;
        termios::cfsetspeed(&mut tio, baud)
            .map_err(|e| Error::with_source(ErrorKind::SerialOpenFailed, "setting baud rate", e))?;
        termios::tcsetattr(file.as_fd(), SetArg::TCSANOW, &tio)
            .map_err(|e| Error::with_source(ErrorKind::SerialOpenFailed, "applying termios", e))?;

        Ok(Self { file })
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.file
            .write(buf)
            .map_err(|e| Error::with_source(ErrorKind::BadSerialParam, "serial write failed", e))
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file
            .read(buf)
            .map_err(|e| Error::with_source(ErrorKind::BadSerialParam, "serial read failed", e))
    }
}

fn speed_to_baud_rate(speed: u32) -> Result<BaudRate> {
    let baud = match speed {
        50 => BaudRate::B50,
        75 => BaudRate::B75,
        110 => BaudRate::B110,
        134 => BaudRate::B134,
        150 => BaudRate::B150,
        200 => BaudRate::B200,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        1800 => BaudRate::B1800,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        other => return Err(Error::new(ErrorKind::BadSerialSpeed, format!("unsupported speed {other}"))),
    };
    Ok(baud)
}
