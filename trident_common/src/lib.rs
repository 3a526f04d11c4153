//! # Trident Common Library
//!
//! Shared foundation for the Trident linear-delta motion core: configuration
//! loading and validation, the parsed machine-command interface, and the
//! timing constants every other crate agrees on.
//!
//! Nothing in this crate touches hardware. The hardware-facing crates
//! (`trident_hal`, `trident`) and the geometry crate (`trident_motion`)
//! all build on the types defined here.

pub mod command;
pub mod config;
pub mod consts;

pub use command::MachineCommand;
pub use config::{ConfigError, PrinterConfig};
