//! # Trident HAL
//!
//! Hardware access for the BCM2835-class SoC the printer runs on: memory
//! mapped peripheral windows over `/dev/mem`, the GPIO register block, the
//! 1 MHz system timer, page-locked DMA memory, the DMA GPIO ring engine,
//! and the inversion-aware exit-safe pin abstraction everything else is
//! built from.
//!
//! Every hardware path has a simulation twin (`SimBus`, `SimClock`) so the
//! full stack above this crate runs and tests without a Raspberry Pi.

pub mod dma;
pub mod drivers;
pub mod error;
pub mod gpio;
pub mod mmap;
pub mod physpage;
pub mod pin;
pub mod timer;

pub use error::HalError;
pub use gpio::{Level, PinBackend, PrimitiveIoPin, Pull, SimBus};
pub use pin::{DefaultState, IoPin, PinFlags};
pub use timer::{Clock, MonotonicClock, SimClock, SysTimer};
