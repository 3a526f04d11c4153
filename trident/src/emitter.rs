//! GPIO emission paths.
//!
//! Direct mode writes pins at their deadline after the scheduler's
//! busy-wait. DMA mode instead rasterizes each edge into the frame ring
//! ahead of real time; the hardware replays the frames at exactly one per
//! frame period, paced by the PWM DREQ.
//!
//! The writer cursor must stay between the DMA read cursor (plus slack)
//! and one full lap ahead of it. Falling behind is an underrun: the
//! affected frames were already consumed, so their events are dropped —
//! replaying them late would be worse than losing them — and the cursor
//! resynchronizes past the read position.

use crate::error::EngineError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use trident_hal::dma::{DmaEngine, FrameRing};

/// Minimum frames kept between the read cursor and anything we touch.
const SLACK_FRAMES: u64 = 64;

/// Where the hardware read position comes from.
pub enum RingCursor {
    /// The live DMA channel's SOURCE_AD register.
    Hw(DmaEngine),
    /// A test-injected frame index.
    Test(Arc<AtomicUsize>),
}

pub struct DmaEmitter {
    ring: FrameRing,
    cursor: RingCursor,
    frame_period_us: u64,
    /// Time of absolute frame 0.
    base_us: u64,
    /// Absolute (non-wrapping) index of the last frame written or cleared.
    write_frame: u64,
    /// Absolute read cursor estimate, advanced from hardware observations.
    hw_frame: u64,
    /// Events dropped to underruns since the last report.
    dropped: u64,
}

impl DmaEmitter {
    /// `base_us` anchors frame 0; pass the current time at bring-up.
    pub fn new(ring: FrameRing, cursor: RingCursor, frame_period_us: u64, base_us: u64) -> Self {
        let mut emitter = Self {
            ring,
            cursor,
            frame_period_us,
            base_us,
            write_frame: 0,
            hw_frame: 0,
            dropped: 0,
        };
        emitter.observe_hw();
        emitter.write_frame = emitter.hw_frame + SLACK_FRAMES;
        emitter
    }

    fn frames(&self) -> u64 {
        self.ring.frame_count() as u64
    }

    /// Advance the absolute read-cursor estimate from the hardware index.
    /// Must be called at least once per ring lap, which the event loop's
    /// cadence guarantees by orders of magnitude.
    fn observe_hw(&mut self) {
        let frames = self.frames();
        let idx = match &self.cursor {
            RingCursor::Hw(engine) => engine.read_frame_index(&self.ring) as u64,
            RingCursor::Test(atomic) => atomic.load(Ordering::SeqCst) as u64,
        } % frames;
        let old_idx = self.hw_frame % frames;
        self.hw_frame += (idx + frames - old_idx) % frames;
    }

    fn frame_for(&self, t_us: u64) -> u64 {
        t_us.saturating_sub(self.base_us) / self.frame_period_us
    }

    /// The furthest deadline that can currently be rasterized without
    /// lapping the read cursor.
    pub fn horizon_us(&self) -> u64 {
        let frame = self.hw_frame + self.frames() - SLACK_FRAMES;
        self.base_us + frame * self.frame_period_us
    }

    /// Width of the usable rasterization window [µs].
    pub fn window_us(&self) -> u64 {
        (self.frames() - SLACK_FRAMES) * self.frame_period_us
    }

    /// Rasterize one edge: OR the pin bit into the SET or CLR word of the
    /// frame covering `t_us`. Events with identical deadlines land in the
    /// same frame and execute simultaneously in hardware.
    pub fn emit(
        &mut self,
        t_us: u64,
        line: u32,
        physical_high: bool,
    ) -> Result<(), EngineError> {
        self.observe_hw();
        let target = self.frame_for(t_us);

        // Too late: the hardware already consumed (or is about to consume)
        // that frame. Resynchronize and drop.
        if target <= self.hw_frame + SLACK_FRAMES {
            self.dropped += 1;
            if self.write_frame <= self.hw_frame + SLACK_FRAMES {
                self.write_frame = self.hw_frame + SLACK_FRAMES;
            }
            return Err(EngineError::DmaUnderrun {
                dropped: self.dropped,
            });
        }

        // Too early: would lap the read cursor. Busy-wait on the hardware
        // cursor until the frame is a lap-safe distance away.
        while target >= self.hw_frame + self.frames() - SLACK_FRAMES {
            std::hint::spin_loop();
            self.observe_hw();
        }

        // Zero every frame between the last write position and the target;
        // they were either consumed last lap or must replay as no-ops.
        let frames = self.frames();
        while self.write_frame < target {
            self.write_frame += 1;
            self.ring.clear_frame((self.write_frame % frames) as usize);
        }

        let slot = (target % frames) as usize;
        let mask = 1u32 << line;
        if physical_high {
            self.ring.or_set(slot, mask);
        } else {
            self.ring.or_clr(slot, mask);
        }
        Ok(())
    }

    /// Events dropped to underruns so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Check the channel's DEBUG register; a latched bus error resets the
    /// channel and rebuilds the ring from the current deadline. Events
    /// already rasterized into the cleared frames are lost, like any
    /// underrun.
    pub fn maintain(&mut self) {
        let fault = match &self.cursor {
            RingCursor::Hw(engine) => engine.check_debug().err(),
            RingCursor::Test(_) => None,
        };
        if let Some(e) = fault {
            tracing::error!(error = %e, "DMA bus fault; rebuilding ring");
            self.ring.clear_all();
            if let RingCursor::Hw(engine) = &self.cursor {
                engine.start();
            }
            self.observe_hw();
            self.write_frame = self.hw_frame + SLACK_FRAMES;
        }
    }

    /// Flush silence and stop the channel.
    pub fn shutdown(&mut self) {
        if let RingCursor::Hw(engine) = &self.cursor {
            engine.shutdown(&mut self.ring);
        } else {
            self.ring.clear_all();
        }
    }

    /// Test access to the rasterized frames.
    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_emitter() -> (DmaEmitter, Arc<AtomicUsize>) {
        let cursor = Arc::new(AtomicUsize::new(0));
        let ring = FrameRing::heap(2); // 1024 frames
        let emitter = DmaEmitter::new(ring, RingCursor::Test(cursor.clone()), 1, 0);
        (emitter, cursor)
    }

    #[test]
    fn edge_lands_in_its_frame() {
        let (mut emitter, _) = test_emitter();
        emitter.emit(200, 22, true).unwrap();
        emitter.emit(201, 22, false).unwrap();
        assert_eq!(emitter.ring().frame(200), (1 << 22, 0));
        assert_eq!(emitter.ring().frame(201), (0, 1 << 22));
    }

    #[test]
    fn simultaneous_deadlines_share_a_frame() {
        let (mut emitter, _) = test_emitter();
        emitter.emit(300, 22, true).unwrap();
        emitter.emit(300, 19, true).unwrap();
        emitter.emit(300, 13, false).unwrap();
        let (set, clr) = emitter.ring().frame(300);
        assert_eq!(set, (1 << 22) | (1 << 19));
        assert_eq!(clr, 1 << 13);
    }

    #[test]
    fn frames_between_writes_are_zeroed() {
        let (mut emitter, _) = test_emitter();
        // Pre-dirty a frame the writer will pass over, as a stale lap
        // would.
        emitter.ring.or_set(400, 0xFFFF);
        emitter.emit(500, 4, true).unwrap();
        assert_eq!(emitter.ring().frame(400), (0, 0));
        assert_eq!(emitter.ring().frame(500), (1 << 4, 0));
    }

    #[test]
    fn late_event_is_dropped_as_underrun() {
        let (mut emitter, cursor) = test_emitter();
        cursor.store(600, std::sync::atomic::Ordering::SeqCst);
        let err = emitter.emit(610, 22, true).unwrap_err();
        assert!(matches!(err, EngineError::DmaUnderrun { dropped: 1 }));
        // The frame was not touched.
        assert_eq!(emitter.ring().frame(610), (0, 0));
        // Later events still flow.
        emitter.emit(800, 22, true).unwrap();
        assert_eq!(emitter.ring().frame(800), (1 << 22, 0));
        assert_eq!(emitter.dropped(), 1);
    }

    #[test]
    fn horizon_stays_one_lap_ahead() {
        let (emitter, _) = test_emitter();
        // 1024 frames, 64 slack: horizon is 960 µs past base.
        assert_eq!(emitter.horizon_us(), 960);
    }
}
