//! Version-agnostic pieces of the GPIO character-device ABI
//! ([gpio.h](https://elixir.bootlin.com/linux/v6.9.2/source/include/uapi/linux/gpio.h)).

use std::{borrow::Cow, ffi::CStr, fmt::Debug, os::fd::AsRawFd};

use crate::Result;

pub(crate) mod ffi {
    pub(crate) const GPIO_MAX_NAME_SIZE: usize = 32;
    pub(crate) const GPIO_IOC_MAGIC: u8 = 0xB4;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub(crate) struct Padding<T, const N: usize>(#[allow(dead_code)] [T; N]);

    #[derive(Debug)]
    #[repr(transparent)]
    pub(crate) struct CString<const N: usize>(pub(crate) [libc::c_char; N]);

    /// Information about a certain GPIO chip.
    #[derive(Debug)]
    #[repr(C)]
    pub(crate) struct GpioChipInfo {
        pub(crate) name: CString<GPIO_MAX_NAME_SIZE>,
        pub(crate) label: CString<GPIO_MAX_NAME_SIZE>,
        /// number of GPIO lines on this chip
        pub(crate) lines: u32,
    }

    crate::macros::wrap_ioctl!(
        ioctl_read!(
            gpio_get_chipinfo_ioctl,
            crate::common::ffi::GPIO_IOC_MAGIC,
            0x01,
            crate::common::ffi::GpioChipInfo
        ),
        crate::error::IoctlKind::GetChipInfo
    );

    crate::macros::wrap_ioctl!(
        ioctl_readwrite!(
            gpio_get_lineinfo_unwatch_ioctl,
            crate::common::ffi::GPIO_IOC_MAGIC,
            0x0C,
            u32
        ),
        crate::error::IoctlKind::GetLineInfo
    );
}

/// Information about a GPIO chip, as reported by the kernel.
#[repr(transparent)]
pub struct ChipInfo {
    inner: ffi::GpioChipInfo,
}

impl ChipInfo {
    pub fn name(&self) -> Cow<'_, str> {
        cstr_lossy(&self.inner.name.0)
    }

    pub fn label(&self) -> Cow<'_, str> {
        cstr_lossy(&self.inner.label.0)
    }

    /// Number of GPIO lines on this chip.
    pub fn lines(&self) -> u32 {
        self.inner.lines
    }
}

impl Debug for ChipInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChipInfo")
            .field("name", &self.name())
            .field("label", &self.label())
            .field("lines", &self.lines())
            .finish()
    }
}

/// Retrieve `(name, label, line-count)` for the chip backing `fd`.
pub fn get_chipinfo(fd: impl AsRawFd) -> Result<ChipInfo> {
    let mut inner: ffi::GpioChipInfo = unsafe { std::mem::zeroed() };
    ffi::gpio_get_chipinfo_ioctl(fd.as_raw_fd(), &mut inner)?;
    Ok(ChipInfo { inner })
}

/// Stop watching a line previously armed with `get_lineinfo_watch`.
pub fn lineinfo_unwatch(fd: impl AsRawFd, mut offset: u32) -> Result<()> {
    ffi::gpio_get_lineinfo_unwatch_ioctl(fd.as_raw_fd(), &mut offset)?;
    Ok(())
}

pub(crate) fn cstr_lossy(bytes: &[libc::c_char]) -> Cow<'_, str> {
    let bytes = unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const u8, bytes.len()) };
    CStr::from_bytes_until_nul(bytes)
        .unwrap_or(c"")
        .to_string_lossy()
}
