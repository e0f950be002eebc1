//! Tuning knobs for players and the mixing engine.

/// Shortest queue a player will allocate, in seconds.
pub const MIN_BUFFER_SECONDS: f64 = 0.25;
/// Longest queue a player will allocate, in seconds.
pub const MAX_BUFFER_SECONDS: f64 = 4.0;

/// Per-player buffering parameters.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Target duration of audio held in the player's queue.
    pub buffer_seconds: f64,
    /// How much audio a preview seek plays before stopping.
    pub preview_seconds: f64,
    /// Reader fill target, in multiples of the engine's max callback size.
    pub read_ahead_callbacks: usize,
    /// Capacity of the render-thread to control-thread event channel.
    pub event_capacity: usize,
}

impl Default for PlaybackConfig {
    /// One second of queue, half-second previews.
    fn default() -> Self {
        Self {
            buffer_seconds: 1.0,
            preview_seconds: 0.5,
            read_ahead_callbacks: 4,
            event_capacity: 256,
        }
    }
}

impl PlaybackConfig {
    /// Queue duration actually used for sizing, clamped to the supported range.
    ///
    /// Non-finite values fall back to the default.
    pub fn effective_buffer_seconds(&self) -> f64 {
        if !self.buffer_seconds.is_finite() {
            return Self::default().buffer_seconds;
        }
        self.buffer_seconds
            .clamp(MIN_BUFFER_SECONDS, MAX_BUFFER_SECONDS)
    }

    /// Preview length, never negative.
    pub fn effective_preview_seconds(&self) -> f64 {
        if self.preview_seconds.is_finite() {
            self.preview_seconds.max(0.0)
        } else {
            Self::default().preview_seconds
        }
    }
}

/// Output-side parameters for the mixing engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output channel count.
    pub channels: usize,
    /// Largest block handed to a player's render callback in one call.
    pub max_output_frames: usize,
    /// Maximum number of simultaneously registered players.
    pub max_players: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            max_output_frames: 512,
            max_players: 8,
        }
    }
}
