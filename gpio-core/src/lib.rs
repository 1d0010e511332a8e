//! Line management, software-timed waveform transmission, edge sampling
//! and bus adapters for Linux GPIO character devices, plus the embedded
//! scripting VM that drives them without a daemon round-trip per call.
//!
//! This crate has no network surface of its own; `gpiod` wraps an
//! [`Engine`] with the wire protocol, permit checks and session state.

pub mod bus;
pub mod chip;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handle;
pub mod lcb;
pub mod notifier;
pub mod report;
pub mod script;
pub mod sampler;
pub mod time;
pub mod tx;

pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use handle::{Handle, HandleKind};
pub use lcb::LineFlags;
