//! Flags and counters shared by a player's control thread, reader thread, render callback
//! and event dispatcher.
//!
//! The render callback only ever touches the atomics. Generation changes and the
//! end-of-data stop also take `transition`, so a stop decided for one generation cannot land
//! after the controller has started the next.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    /// Controller wants the callback to deliver audio.
    pub should_send: AtomicBool,
    /// Callback is currently delivering audio (or was, on its last invocation).
    pub is_sending: AtomicBool,
    /// User-visible playing state.
    pub is_playing: AtomicBool,
    /// Bumped on every seek/reset; events from older generations are dropped.
    generation: AtomicU64,
    transition: Mutex<()>,
    start_position_bits: AtomicU64,
    sample_rate: AtomicU32,
    /// Frames played since the current generation started.
    pub frames_played: AtomicU64,
    /// Frames of real audio handed to the engine, across all generations.
    pub frames_rendered: AtomicU64,
    pub underrun_events: AtomicU64,
    pub underrun_frames: AtomicU64,
}

impl SessionState {
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a new generation and return it.
    pub fn advance_generation(&self) -> u64 {
        let _transition = self.transition();
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Clear `is_playing` and `should_send` if `generation` is still the current one.
    ///
    /// Returns whether the stop was applied.
    pub fn stop_generation(&self, generation: u64) -> bool {
        let _transition = self.transition();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.is_playing.store(false, Ordering::Release);
        self.should_send.store(false, Ordering::SeqCst);
        true
    }

    fn transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start_position(&self) -> f64 {
        f64::from_bits(self.start_position_bits.load(Ordering::Acquire))
    }

    pub fn set_start_position(&self, seconds: f64) {
        self.start_position_bits
            .store(seconds.to_bits(), Ordering::Release);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Release);
    }

    /// Media position after `frame_index` frames of the current generation.
    pub fn position_seconds(&self, frame_index: u64) -> f64 {
        let rate = self.sample_rate();
        if rate == 0 {
            return self.start_position();
        }
        self.start_position() + frame_index as f64 / rate as f64
    }
}
