//! I²C/SMBus device adapter, opened against `/dev/i2c-<bus>` and bound
//! to one slave address via the `I2C_SLAVE` ioctl.
//!
//! There's no maintained SMBus-ioctl crate in the same family as the
//! GPIO bindings this workspace builds on, so the `i2c-dev` ioctl
//! surface is hand-rolled here the same way `gpio-uapi` hand-rolls the
//! GPIO character-device ioctls: `nix::ioctl_*!` over a `#[repr(C)]`
//! struct matching the kernel UAPI header.

use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
    path::Path,
};

use crate::error::{Error, ErrorKind, Result};

const I2C_IOC_MAGIC: u8 = 0x07;
const I2C_SLAVE_NR: u8 = 0x03;
const I2C_SMBUS_NR: u8 = 0x20;
const I2C_SMBUS_READ: u8 = 1;
const I2C_SMBUS_WRITE: u8 = 0;

const I2C_SMBUS_QUICK: u32 = 0;
const I2C_SMBUS_BYTE: u32 = 1;
const I2C_SMBUS_BYTE_DATA: u32 = 2;
const I2C_SMBUS_WORD_DATA: u32 = 3;
const I2C_SMBUS_BLOCK_DATA: u32 = 5;

pub const MAX_ADDR: u16 = 127;
pub const MAX_BLOCK_LEN: usize = 32;

#[repr(C)]
struct SmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut SmbusData,
}

#[repr(C)]
union SmbusData {
    byte: u8,
    word: u16,
    block: [u8; 34],
}

nix::ioctl_write_int!(i2c_set_slave, I2C_IOC_MAGIC, I2C_SLAVE_NR);
nix::ioctl_readwrite!(i2c_smbus_xfer, I2C_IOC_MAGIC, I2C_SMBUS_NR, SmbusIoctlData);

pub struct I2cDevice {
    file: File,
    pub address: u16,
}

impl I2cDevice {
    pub fn open(bus: u32, address: u16, flags: u32) -> Result<Self> {
        if address > MAX_ADDR {
            return Err(Error::new(ErrorKind::BadI2cAddr, format!("address {address} out of range")));
        }
        if flags != 0 {
            return Err(Error::new(ErrorKind::BadI2cFlags, "flags must be 0"));
        }
        let path = format!("/dev/i2c-{bus}");
        if !Path::new(&path).exists() {
            return Err(Error::new(ErrorKind::BadI2cBus, format!("no such bus: {path}")));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::with_source(ErrorKind::I2cOpenFailed, "opening i2c bus", e))?;
        unsafe { i2c_set_slave(file.as_raw_fd(), address as u64) }
            .map_err(|e| Error::with_source(ErrorKind::I2cOpenFailed, "binding slave address", e))?;
        Ok(Self { file, address })
    }

    fn xfer(&self, read_write: u8, command: u8, size: u32, data: *mut SmbusData) -> Result<()> {
        let mut ioctl_data = SmbusIoctlData { read_write, command, size, data };
        unsafe { i2c_smbus_xfer(self.file.as_raw_fd(), &mut ioctl_data) }
            .map_err(|e| Error::with_source(ErrorKind::BadI2cParam, "smbus transfer failed", e))?;
        Ok(())
    }

    pub fn write_quick(&self, bit: u8) -> Result<()> {
        if bit > 1 {
            return Err(Error::new(ErrorKind::BadI2cParam, "write_quick bit must be 0 or 1"));
        }
        self.xfer(bit, 0, I2C_SMBUS_QUICK, std::ptr::null_mut())
    }

    pub fn read_byte(&self) -> Result<u8> {
        let mut data = SmbusData { byte: 0 };
        self.xfer(I2C_SMBUS_READ, 0, I2C_SMBUS_BYTE, &mut data)?;
        Ok(unsafe { data.byte })
    }

    pub fn write_byte(&self, value: u8) -> Result<()> {
        self.xfer(I2C_SMBUS_WRITE, value, I2C_SMBUS_BYTE, std::ptr::null_mut())
    }

    pub fn read_byte_data(&self, register: u8) -> Result<u8> {
        let mut data = SmbusData { byte: 0 };
        self.xfer(I2C_SMBUS_READ, register, I2C_SMBUS_BYTE_DATA, &mut data)?;
        Ok(unsafe { data.byte })
    }

    pub fn write_byte_data(&self, register: u8, value: u8) -> Result<()> {
        let mut data = SmbusData { byte: value };
        self.xfer(I2C_SMBUS_WRITE, register, I2C_SMBUS_BYTE_DATA, &mut data)
    }

    pub fn read_word_data(&self, register: u8) -> Result<u16> {
        let mut data = SmbusData { word: 0 };
        self.xfer(I2C_SMBUS_READ, register, I2C_SMBUS_WORD_DATA, &mut data)?;
        Ok(unsafe { data.word })
    }

    pub fn write_word_data(&self, register: u8, value: u16) -> Result<()> {
        let mut data = SmbusData { word: value };
        self.xfer(I2C_SMBUS_WRITE, register, I2C_SMBUS_WORD_DATA, &mut data)
    }

    pub fn write_block_data(&self, register: u8, values: &[u8]) -> Result<()> {
        if values.is_empty() || values.len() > MAX_BLOCK_LEN {
            return Err(Error::new(ErrorKind::BadI2cParam, "block length must be 1..=32"));
        }
        let mut block = [0u8; 34];
        block[0] = values.len() as u8;
        block[1..=values.len()].copy_from_slice(values);
        let mut data = SmbusData { block };
        self.xfer(I2C_SMBUS_WRITE, register, I2C_SMBUS_BLOCK_DATA, &mut data)
    }

    pub fn read_block_data(&self, register: u8) -> Result<Vec<u8>> {
        let mut block = [0u8; 34];
        let mut data = SmbusData { block };
        self.xfer(I2C_SMBUS_READ, register, I2C_SMBUS_BLOCK_DATA, &mut data)?;
        block = unsafe { data.block };
        let len = block[0] as usize;
        Ok(block[1..=len.min(MAX_BLOCK_LEN)].to_vec())
    }
}
