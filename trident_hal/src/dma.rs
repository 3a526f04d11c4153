//! DMA GPIO engine: a closed ring of control blocks that copies
//! pre-prepared `{GPSET0, GPCLR0}` register images into the GPIO block at a
//! fixed frame rate, paced by the PWM peripheral's DREQ line.
//!
//! The ring itself (`FrameRing`) is plain memory and carries all the
//! rasterization logic; only `DmaEngine` touches registers. That split is
//! what lets the scheduler's DMA emission path run under test without a
//! Raspberry Pi.

use crate::error::HalError;
use crate::mmap::{PeripheralWindow, GPIO_BUS_BASE, PAGE_SIZE};
use crate::physpage::PhysPage;
use std::sync::Arc;
use std::time::Duration;

/// Bytes per source frame: one GPSET0 word plus one GPCLR0 word.
pub const FRAME_BYTES: usize = 8;
/// Source frames per page.
pub const FRAMES_PER_PAGE: usize = PAGE_SIZE / FRAME_BYTES;
/// Control blocks per page (32 bytes each, 256-bit aligned).
pub const CBS_PER_PAGE: usize = PAGE_SIZE / 32;

// Transfer-information flags.
const TI_NO_WIDE_BURSTS: u32 = 1 << 26;
const TI_PERMAP_PWM: u32 = 5 << 16;
const TI_SRC_INC: u32 = 1 << 8;
const TI_DEST_DREQ: u32 = 1 << 6;
const TI_WAIT_RESP: u32 = 1 << 3;

// Channel CS flags.
const CS_RESET: u32 = 1 << 31;
const CS_ACTIVE: u32 = 1 << 0;

// DEBUG register error flags.
const DEBUG_READ_ERROR: u32 = 1 << 2;
const DEBUG_FIFO_ERROR: u32 = 1 << 1;
const DEBUG_READ_LAST_NOT_SET: u32 = 1 << 0;
const DEBUG_ERROR_MASK: u32 = DEBUG_READ_ERROR | DEBUG_FIFO_ERROR | DEBUG_READ_LAST_NOT_SET;

// Per-channel register word offsets (channel base = channel * 0x100).
const REG_CS: usize = 0;
const REG_CONBLK_AD: usize = 1;
const REG_SOURCE_AD: usize = 3;
const REG_DEBUG: usize = 8;
const DMA_ENABLE_WORD: usize = 0xFF0 / 4;

// Bus address of GPSET0 — the fixed DMA destination.
const GPSET0_BUS: u32 = GPIO_BUS_BASE + crate::gpio::GPSET0_BYTE_OFFSET;

// PWM register word offsets.
const PWM_CTL: usize = 0x00 / 4;
const PWM_DMAC: usize = 0x08 / 4;
const PWM_RNG1: usize = 0x10 / 4;
const PWM_CTL_PWEN1: u32 = 1 << 0;
const PWM_DMAC_ENAB: u32 = 1 << 31;

// Clock-manager words for the PWM clock.
const CM_PWMCTL: usize = 0xA0 / 4;
const CM_PWMDIV: usize = 0xA4 / 4;
const CM_PASSWD: u32 = 0x5A << 24;
const CM_ENAB: u32 = 1 << 4;
const CM_KILL: u32 = 1 << 5;
const CM_BUSY: u32 = 1 << 7;
const CM_SRC_PLLD: u32 = 6;
/// PLLD runs at 500 MHz; divide down to the 1 MHz frame clock.
const PLLD_MHZ: u32 = 500;

// ─── Frame ring ─────────────────────────────────────────────────────

enum RingPage {
    /// Locked, physically addressable — required for real DMA.
    Phys(PhysPage),
    /// Plain heap page for tests and simulation.
    Heap(Box<[u32; PAGE_SIZE / 4]>),
}

impl RingPage {
    #[inline]
    fn read_word(&self, word: usize) -> u32 {
        match self {
            Self::Phys(p) => p.read_word(word),
            Self::Heap(p) => p[word],
        }
    }

    #[inline]
    fn write_word(&mut self, word: usize, value: u32) {
        match self {
            Self::Phys(p) => p.write_word(word, value),
            Self::Heap(p) => p[word] = value,
        }
    }
}

/// The circular buffer of GPIO register images.
///
/// Frame `i` holds the SET and CLR words the DMA engine will write at tick
/// `i` of its lap around the ring.
pub struct FrameRing {
    pages: Vec<RingPage>,
    frames: usize,
}

impl FrameRing {
    /// Heap-backed ring: rasterization logic only, no DMA possible.
    pub fn heap(pages: usize) -> Self {
        let pages = (0..pages)
            .map(|_| RingPage::Heap(Box::new([0u32; PAGE_SIZE / 4])))
            .collect::<Vec<_>>();
        let frames = pages.len() * FRAMES_PER_PAGE;
        Self { pages, frames }
    }

    /// Page-locked ring suitable for the hardware engine.
    pub fn locked(pages: usize) -> Result<Self, HalError> {
        let pages = (0..pages)
            .map(|_| PhysPage::new().map(RingPage::Phys))
            .collect::<Result<Vec<_>, _>>()?;
        let frames = pages.len() * FRAMES_PER_PAGE;
        Ok(Self { pages, frames })
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    pub fn is_locked(&self) -> bool {
        self.pages.iter().all(|p| matches!(p, RingPage::Phys(_)))
    }

    #[inline]
    fn locate(&self, frame: usize) -> (usize, usize) {
        debug_assert!(frame < self.frames);
        (frame / FRAMES_PER_PAGE, (frame % FRAMES_PER_PAGE) * 2)
    }

    /// OR a pin mask into the frame's GPSET0 word.
    pub fn or_set(&mut self, frame: usize, mask: u32) {
        let (page, word) = self.locate(frame);
        let cur = self.pages[page].read_word(word);
        self.pages[page].write_word(word, cur | mask);
    }

    /// OR a pin mask into the frame's GPCLR0 word.
    pub fn or_clr(&mut self, frame: usize, mask: u32) {
        let (page, word) = self.locate(frame);
        let cur = self.pages[page].read_word(word + 1);
        self.pages[page].write_word(word + 1, cur | mask);
    }

    /// Zero one frame (a no-op register image).
    pub fn clear_frame(&mut self, frame: usize) {
        let (page, word) = self.locate(frame);
        self.pages[page].write_word(word, 0);
        self.pages[page].write_word(word + 1, 0);
    }

    /// Zero the entire ring.
    pub fn clear_all(&mut self) {
        for frame in 0..self.frames {
            self.clear_frame(frame);
        }
    }

    /// The `(GPSET0, GPCLR0)` image of one frame.
    pub fn frame(&self, frame: usize) -> (u32, u32) {
        let (page, word) = self.locate(frame);
        (
            self.pages[page].read_word(word),
            self.pages[page].read_word(word + 1),
        )
    }

    /// Bus address of a frame's SET word. `None` for heap-backed rings.
    pub fn frame_bus_addr(&self, frame: usize) -> Option<u32> {
        let (page, word) = self.locate(frame);
        match &self.pages[page] {
            RingPage::Phys(p) => Some(p.bus_addr() + (word * 4) as u32),
            RingPage::Heap(_) => None,
        }
    }

    /// Which frame a DMA SOURCE_AD value is reading, if it points into the
    /// ring.
    pub fn frame_of_bus_addr(&self, bus_addr: u32) -> Option<usize> {
        for (idx, page) in self.pages.iter().enumerate() {
            if let RingPage::Phys(p) = page {
                let base = p.bus_addr();
                if bus_addr >= base && bus_addr < base + PAGE_SIZE as u32 {
                    let offset = (bus_addr - base) as usize;
                    return Some(idx * FRAMES_PER_PAGE + offset / FRAME_BYTES);
                }
            }
        }
        None
    }
}

// ─── DMA engine ─────────────────────────────────────────────────────

/// Hardware driver for one DMA channel running a closed GPIO ring.
pub struct DmaEngine {
    dma: Arc<PeripheralWindow>,
    pwm: Arc<PeripheralWindow>,
    clk: Arc<PeripheralWindow>,
    channel: usize,
    channel_base: usize,
    cb_pages: Vec<PhysPage>,
    first_cb_bus: u32,
    frame_period_us: u64,
    frames: usize,
}

impl DmaEngine {
    /// Build the control-block chain for `ring` and configure the PWM
    /// pacer. The ring must be page-locked.
    pub fn build(
        dma: Arc<PeripheralWindow>,
        pwm: Arc<PeripheralWindow>,
        clk: Arc<PeripheralWindow>,
        channel: u32,
        ring: &FrameRing,
        frame_period_us: u64,
    ) -> Result<Self, HalError> {
        if !ring.is_locked() {
            return Err(HalError::DmaSetup(
                "frame ring is heap-backed; DMA needs locked pages".to_string(),
            ));
        }
        let frames = ring.frame_count();
        let cb_page_count = frames.div_ceil(CBS_PER_PAGE);
        let cb_pages = (0..cb_page_count)
            .map(|_| PhysPage::new())
            .collect::<Result<Vec<_>, _>>()?;

        // One control block per frame: copy 8 bytes from the frame into
        // GPSET0/GPCLR0, gated by the PWM DREQ, then chain to the next
        // frame's block. The last block closes the ring.
        for frame in 0..frames {
            let page = &cb_pages[frame / CBS_PER_PAGE];
            let word = (frame % CBS_PER_PAGE) * 8;
            let src = ring
                .frame_bus_addr(frame)
                .ok_or_else(|| HalError::DmaSetup("unmapped ring frame".to_string()))?;
            let next = if frame + 1 == frames { 0 } else { frame + 1 };
            let next_bus = cb_bus_addr(&cb_pages, next);

            page.write_word(
                word,
                TI_NO_WIDE_BURSTS | TI_PERMAP_PWM | TI_SRC_INC | TI_DEST_DREQ | TI_WAIT_RESP,
            );
            page.write_word(word + 1, src); // SOURCE_AD
            page.write_word(word + 2, GPSET0_BUS); // DEST_AD
            page.write_word(word + 3, FRAME_BYTES as u32); // TXFR_LEN
            page.write_word(word + 4, 0); // STRIDE
            page.write_word(word + 5, next_bus); // NEXTCONBK
        }
        let first_cb_bus = cb_bus_addr(&cb_pages, 0);

        let engine = Self {
            channel_base: channel as usize * 0x100 / 4,
            channel: channel as usize,
            dma,
            pwm,
            clk,
            cb_pages,
            first_cb_bus,
            frame_period_us,
            frames,
        };
        engine.configure_pacer();
        Ok(engine)
    }

    /// Configure the PWM peripheral to pulse DREQ once per frame period.
    fn configure_pacer(&self) {
        // Stop the PWM and kill its clock before reprogramming.
        self.pwm.write_word(PWM_CTL, 0);
        self.clk.write_word(CM_PWMCTL, CM_PASSWD | CM_KILL);
        while self.clk.read_word(CM_PWMCTL) & CM_BUSY != 0 {
            std::hint::spin_loop();
        }

        // PLLD / 500 = 1 MHz PWM clock; RNG1 then counts frame periods.
        self.clk
            .write_word(CM_PWMDIV, CM_PASSWD | (PLLD_MHZ << 12));
        self.clk
            .write_word(CM_PWMCTL, CM_PASSWD | CM_ENAB | CM_SRC_PLLD);

        self.pwm.write_word(PWM_RNG1, self.frame_period_us as u32);
        // Panic/DREQ thresholds of 7 keep requests flowing one at a time.
        self.pwm
            .write_word(PWM_DMAC, PWM_DMAC_ENAB | (7 << 8) | 7);
        self.pwm.write_word(PWM_CTL, PWM_CTL_PWEN1);
    }

    /// Reset the channel, clear latched errors, point it at the first
    /// control block, and go.
    pub fn start(&self) {
        self.dma
            .write_masked(DMA_ENABLE_WORD, 1 << self.channel, 1 << self.channel);
        self.dma.write_word(self.channel_base + REG_CS, CS_RESET);
        std::thread::sleep(Duration::from_micros(100));
        self.dma
            .write_word(self.channel_base + REG_DEBUG, DEBUG_ERROR_MASK);
        self.dma
            .write_word(self.channel_base + REG_CONBLK_AD, self.first_cb_bus);
        self.dma.write_word(self.channel_base + REG_CS, CS_ACTIVE);
        tracing::info!(channel = self.channel, frames = self.frames, "DMA ring active");
    }

    /// The frame the engine is currently reading.
    pub fn read_frame_index(&self, ring: &FrameRing) -> usize {
        let src = self.dma.read_word(self.channel_base + REG_SOURCE_AD);
        if let Some(frame) = ring.frame_of_bus_addr(src) {
            return frame;
        }
        // Between control-block loads SOURCE_AD can briefly point past the
        // ring; fall back to the chained CONBLK_AD.
        let cb = self.dma.read_word(self.channel_base + REG_CONBLK_AD);
        self.frame_of_cb_addr(cb).unwrap_or(0)
    }

    fn frame_of_cb_addr(&self, bus_addr: u32) -> Option<usize> {
        for (idx, page) in self.cb_pages.iter().enumerate() {
            let base = page.bus_addr();
            if bus_addr >= base && bus_addr < base + PAGE_SIZE as u32 {
                return Some(idx * CBS_PER_PAGE + (bus_addr - base) as usize / 32);
            }
        }
        None
    }

    /// Check the DEBUG register for latched bus errors, clearing them.
    ///
    /// Recovery from a fault is reset + rebuild from the current deadline,
    /// which the caller owns.
    pub fn check_debug(&self) -> Result<(), HalError> {
        let bits = self.dma.read_word(self.channel_base + REG_DEBUG) & DEBUG_ERROR_MASK;
        if bits == 0 {
            return Ok(());
        }
        self.dma.write_word(self.channel_base + REG_DEBUG, bits);
        Err(HalError::BusFault { bits })
    }

    /// Zero the ring, let the engine play one full lap of silence, then
    /// reset the channel.
    pub fn shutdown(&self, ring: &mut FrameRing) {
        ring.clear_all();
        let lap_us = self.frames as u64 * self.frame_period_us;
        std::thread::sleep(Duration::from_micros(lap_us));
        self.dma.write_word(self.channel_base + REG_CS, CS_RESET);
        self.pwm.write_word(PWM_CTL, 0);
        tracing::info!(channel = self.channel, "DMA ring stopped");
    }
}

fn cb_bus_addr(pages: &[PhysPage], cb: usize) -> u32 {
    pages[cb / CBS_PER_PAGE].bus_addr() + (cb % CBS_PER_PAGE) as u32 * 32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_ring_geometry() {
        let ring = FrameRing::heap(2);
        assert_eq!(ring.frame_count(), 1024);
        assert!(!ring.is_locked());
        assert_eq!(ring.frame_bus_addr(0), None);
    }

    #[test]
    fn or_set_and_clr_accumulate_in_one_frame() {
        let mut ring = FrameRing::heap(1);
        ring.or_set(10, 1 << 4);
        ring.or_set(10, 1 << 22);
        ring.or_clr(10, 1 << 4);
        assert_eq!(ring.frame(10), ((1 << 4) | (1 << 22), 1 << 4));
        // Neighboring frames untouched.
        assert_eq!(ring.frame(9), (0, 0));
        assert_eq!(ring.frame(11), (0, 0));
    }

    #[test]
    fn clear_frame_zeroes_both_words() {
        let mut ring = FrameRing::heap(1);
        ring.or_set(100, 0xFFFF_FFFF);
        ring.or_clr(100, 0xFFFF_FFFF);
        ring.clear_frame(100);
        assert_eq!(ring.frame(100), (0, 0));
    }

    #[test]
    fn frames_wrap_across_pages() {
        let mut ring = FrameRing::heap(2);
        let last_of_first_page = FRAMES_PER_PAGE - 1;
        ring.or_set(last_of_first_page, 1);
        ring.or_set(last_of_first_page + 1, 2);
        assert_eq!(ring.frame(last_of_first_page), (1, 0));
        assert_eq!(ring.frame(last_of_first_page + 1), (2, 0));
    }

    #[test]
    fn heap_ring_refuses_dma_build() {
        // Can't construct a real DmaEngine in a test environment, but the
        // locked-ring precondition must hold before any register is touched.
        let ring = FrameRing::heap(1);
        assert!(!ring.is_locked());
    }
}
