//! `/dev/mem` peripheral windows.
//!
//! The peripheral pages are opened once, mapped once, and shared behind
//! `Arc`s. Register writes go only through the component wrappers that own
//! disjoint register subsets (GPIO block, DMA engine, timer).

use crate::error::HalError;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

/// One page of memory.
pub const PAGE_SIZE: usize = 4096;

// Peripheral offsets from the SoC peripheral base.
const GPIO_OFFSET: u64 = 0x20_0000;
const DMA_OFFSET: u64 = 0x7000;
const PWM_OFFSET: u64 = 0x20_C000;
const CLK_OFFSET: u64 = 0x10_1000;
const TIMER_OFFSET: u64 = 0x3000;

/// Bus-side address of the GPIO block, as seen by the DMA engine.
pub const GPIO_BUS_BASE: u32 = 0x7E20_0000;

/// One mapped page of peripheral registers with volatile word access.
pub struct PeripheralWindow {
    // Held only to keep the mapping alive.
    _map: MmapMut,
    base: *mut u32,
}

// Word-sized volatile register access is safe to share; ordering between
// writers is the scheduler's single-threaded contract.
unsafe impl Send for PeripheralWindow {}
unsafe impl Sync for PeripheralWindow {}

impl PeripheralWindow {
    fn new(mut map: MmapMut) -> Self {
        let base = map.as_mut_ptr() as *mut u32;
        Self { _map: map, base }
    }

    /// Volatile read of the 32-bit register at word index `word`.
    #[inline]
    pub fn read_word(&self, word: usize) -> u32 {
        debug_assert!(word < PAGE_SIZE / 4);
        unsafe { std::ptr::read_volatile(self.base.add(word)) }
    }

    /// Volatile write of the 32-bit register at word index `word`.
    #[inline]
    pub fn write_word(&self, word: usize, value: u32) {
        debug_assert!(word < PAGE_SIZE / 4);
        unsafe { std::ptr::write_volatile(self.base.add(word), value) }
    }

    /// Read-modify-write of the bits selected by `mask`.
    #[inline]
    pub fn write_masked(&self, word: usize, mask: u32, value: u32) {
        let cur = self.read_word(word);
        self.write_word(word, (cur & !mask) | (value & mask));
    }
}

/// All mapped peripheral windows, opened once at startup.
pub struct Peripherals {
    pub gpio: Arc<PeripheralWindow>,
    pub dma: Arc<PeripheralWindow>,
    pub pwm: Arc<PeripheralWindow>,
    pub clk: Arc<PeripheralWindow>,
    pub timer: Arc<PeripheralWindow>,
}

impl Peripherals {
    /// Map every peripheral window off the given SoC base address.
    ///
    /// Fatal on failure: without `/dev/mem` there is no printer.
    pub fn map(peripheral_base: u64) -> Result<Self, HalError> {
        if !nix::unistd::Uid::effective().is_root() {
            return Err(HalError::NotRoot);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/mem")
            .map_err(|source| HalError::PeripheralMap {
                peripheral: "/dev/mem",
                source,
            })?;

        let peripherals = Self {
            gpio: map_window(&file, peripheral_base + GPIO_OFFSET, "gpio")?,
            dma: map_window(&file, peripheral_base + DMA_OFFSET, "dma")?,
            pwm: map_window(&file, peripheral_base + PWM_OFFSET, "pwm")?,
            clk: map_window(&file, peripheral_base + CLK_OFFSET, "clock-manager")?,
            timer: map_window(&file, peripheral_base + TIMER_OFFSET, "system-timer")?,
        };
        tracing::info!(base = peripheral_base, "peripheral windows mapped");
        Ok(peripherals)
    }
}

fn map_window(
    file: &File,
    addr: u64,
    name: &'static str,
) -> Result<Arc<PeripheralWindow>, HalError> {
    let map = unsafe {
        MmapOptions::new()
            .offset(addr)
            .len(PAGE_SIZE)
            .map_mut(file)
    }
    .map_err(|source| HalError::PeripheralMap {
        peripheral: name,
        source,
    })?;
    Ok(Arc::new(PeripheralWindow::new(map)))
}
