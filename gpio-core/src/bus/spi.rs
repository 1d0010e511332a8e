//! SPI device adapter over `/dev/spidevB.C`, using the kernel `spidev`
//! ioctl surface (mode/bits/speed plus the `SPI_IOC_MESSAGE(N)` full
//! duplex transfer ioctl), hand-rolled the same way as `i2c.rs`.

use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
};

use crate::error::{Error, ErrorKind, Result};

const SPI_IOC_MAGIC: u8 = b'k';
const SPI_IOC_NR_MODE: u8 = 1;
const SPI_IOC_NR_BITS_PER_WORD: u8 = 3;
const SPI_IOC_NR_MAX_SPEED_HZ: u8 = 4;
const SPI_IOC_NR_MESSAGE_0: u8 = 0;

pub const MIN_XFER_LEN: usize = 1;
pub const MAX_XFER_LEN: usize = 65536;

#[repr(C)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    pad: u16,
}

nix::ioctl_write_int!(spi_set_mode, SPI_IOC_MAGIC, SPI_IOC_NR_MODE);
nix::ioctl_write_int!(spi_set_bits_per_word, SPI_IOC_MAGIC, SPI_IOC_NR_BITS_PER_WORD);
nix::ioctl_write_int!(spi_set_max_speed_hz, SPI_IOC_MAGIC, SPI_IOC_NR_MAX_SPEED_HZ);
nix::ioctl_write_ptr!(spi_transfer_one, SPI_IOC_MAGIC, SPI_IOC_NR_MESSAGE_0, SpiIocTransfer);

pub struct SpiDevice {
    file: File,
}

impl SpiDevice {
    pub fn open(bus: u32, channel: u32, speed_hz: u32, mode: u8) -> Result<Self> {
        let path = format!("/dev/spidev{bus}.{channel}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::with_source(ErrorKind::SpiOpenFailed, "opening spidev", e))?;
        let fd = file.as_raw_fd();
        unsafe { spi_set_mode(fd, mode as u64) }
            .map_err(|e| Error::with_source(ErrorKind::SpiOpenFailed, "setting mode", e))?;
        unsafe { spi_set_bits_per_word(fd, 8) }
            .map_err(|e| Error::with_source(ErrorKind::SpiOpenFailed, "setting word size", e))?;
        unsafe { spi_set_max_speed_hz(fd, speed_hz as u64) }
            .map_err(|e| Error::with_source(ErrorKind::SpiOpenFailed, "setting clock speed", e))?;
        Ok(Self { file })
    }

    /// Full-duplex transfer: `tx` and `rx` must be the same length
    /// (§4.6). Half-duplex use reads or writes with the other side
    /// absent via `write`/`read`.
    pub fn xfer(&self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        if tx.len() != rx.len() {
            return Err(Error::new(ErrorKind::BadSpiCount, "tx and rx must be equal length"));
        }
        validate_len(tx.len())?;
        let transfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz: 0,
            delay_usecs: 0,
            bits_per_word: 0,
            cs_change: 0,
            tx_nbits: 0,
            rx_nbits: 0,
            pad: 0,
        };
        unsafe { spi_transfer_one(self.file.as_raw_fd(), &transfer) }
            .map_err(|e| Error::with_source(ErrorKind::BadSpiCount, "spi transfer failed", e))?;
        Ok(())
    }

    pub fn write(&self, tx: &[u8]) -> Result<()> {
        let mut rx = vec![0u8; tx.len()];
        self.xfer(tx, &mut rx)
    }

    pub fn read(&self, n: usize) -> Result<Vec<u8>> {
        validate_len(n)?;
        let tx = vec![0u8; n];
        let mut rx = vec![0u8; n];
        self.xfer(&tx, &mut rx)?;
        Ok(rx)
    }
}

fn validate_len(n: usize) -> Result<()> {
    if !(MIN_XFER_LEN..=MAX_XFER_LEN).contains(&n) {
        return Err(Error::new(ErrorKind::BadSpiCount, format!("length {n} out of range")));
    }
    Ok(())
}
