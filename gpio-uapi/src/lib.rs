//! Raw FFI bindings for the Linux GPIO character-device ABI
//! ([gpio.h](https://elixir.bootlin.com/linux/v6.9.2/source/include/uapi/linux/gpio.h)),
//! v2 line-request ioctls only.
//!
//! This crate assembles and sends requests to the kernel, ensuring only
//! that their format is correct, not their validity for the physical
//! device attached to a line. Policy (claim bookkeeping, flag
//! validation, debounce bounds, …) lives one layer up, in `gpio-core`.

pub mod common;
pub mod error;
mod macros;
pub mod v2;

pub use error::{Error, IoctlKind, Result};
