//! Shared output engine: a fixed set of player slots mixed into one output stream.
//!
//! The output callback calls [`AudioEngine::mix_into`]. Registration changes take the slot
//! lock on the control thread; the output callback only `try_lock`s it and emits silence for
//! that block if it loses the race. A render and the mix of the block it returned both happen
//! under that lock, which is what [`AudioEngine::wait_for_mix`] relies on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::EngineConfig;
use crate::format::{AudioFormat, SampleFormat};
use crate::render::{OutputBuffers, RenderCallback, RenderedBlock};

struct PlayerSlot {
    callback: RenderCallback,
    buffers: OutputBuffers,
    gain: f32,
}

pub struct AudioEngine {
    config: EngineConfig,
    slots: Mutex<Vec<Option<PlayerSlot>>>,
    running: AtomicBool,
}

/// Index of a registered player inside the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl AudioEngine {
    pub fn new(config: EngineConfig) -> Self {
        let max_players = config.max_players.max(1);
        Self {
            config: EngineConfig {
                max_players,
                max_output_frames: config.max_output_frames.max(1),
                ..config
            },
            slots: Mutex::new((0..max_players).map(|_| None).collect()),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Format every player is expected to deliver: planar `f32` at the output rate.
    pub fn input_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            sample_format: SampleFormat::F32,
            interleaved: false,
        }
    }

    pub fn max_output_frames(&self) -> usize {
        self.config.max_output_frames
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start pulling from registered players.
    pub fn play(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            tracing::info!("audio engine started");
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("audio engine stopped");
        }
    }

    /// Register a player's render callback in the first free slot.
    ///
    /// Hands the callback back when every slot is taken.
    pub fn add_player(&self, callback: RenderCallback, gain: f32) -> Result<SlotId, RenderCallback> {
        let mut slots = self.slots();
        let Some(index) = slots.iter().position(Option::is_none) else {
            tracing::warn!(
                player = callback.identifier(),
                max_players = self.config.max_players,
                "no free engine slot"
            );
            return Err(callback);
        };
        let buffers = OutputBuffers::new(callback.format(), self.config.max_output_frames);
        tracing::debug!(player = callback.identifier(), slot = index, "player added to engine");
        slots[index] = Some(PlayerSlot {
            callback,
            buffers,
            gain,
        });
        Ok(SlotId(index))
    }

    /// Unregister a player. Stops the engine when it was the last one.
    pub fn remove_player(&self, slot: SlotId) -> Option<RenderCallback> {
        let mut slots = self.slots();
        let removed = slots.get_mut(slot.0).and_then(Option::take)?;
        let empty = slots.iter().all(Option::is_none);
        drop(slots);
        tracing::debug!(player = removed.callback.identifier(), slot = slot.0, "player removed from engine");
        if empty {
            self.stop();
        }
        Some(removed.callback)
    }

    pub fn set_player_gain(&self, slot: SlotId, gain: f32) {
        if let Some(Some(entry)) = self.slots().get_mut(slot.0) {
            entry.gain = gain;
        }
    }

    pub fn player_count(&self) -> usize {
        self.slots().iter().filter(|s| s.is_some()).count()
    }

    /// Block until any `mix_into` in progress has returned.
    ///
    /// A mix that starts after this returns observes every store the caller made before
    /// calling it.
    pub fn wait_for_mix(&self) {
        drop(self.slots());
    }

    /// Fill interleaved output with the sum of every registered player.
    ///
    /// `out.len()` must be a multiple of the output channel count. Real-time safe.
    pub fn mix_into(&self, out: &mut [f32]) {
        out.fill(0.0);
        if !self.is_running() {
            return;
        }
        let Ok(mut slots) = self.slots.try_lock() else {
            return;
        };

        let channels = self.config.channels;
        let total_frames = out.len() / channels;
        let mut offset = 0;
        while offset < total_frames {
            let frames = (total_frames - offset).min(self.config.max_output_frames);
            let dst = &mut out[offset * channels..(offset + frames) * channels];
            for slot in slots.iter_mut().flatten() {
                let gain = slot.gain;
                let format = *slot.callback.format();
                let block = slot.callback.render(frames, &mut slot.buffers);
                if !block.is_silence() {
                    mix_block(&block, &format, gain, dst, channels);
                }
            }
            offset += frames;
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Option<PlayerSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accumulate one block into interleaved `dst`, mapping channels the way a stereo device expects.
fn mix_block(
    block: &RenderedBlock<'_>,
    format: &AudioFormat,
    gain: f32,
    dst: &mut [f32],
    out_channels: usize,
) {
    let bps = format.sample_format.bytes_per_sample();
    let in_channels = format.channels;
    let sample = |frame: usize, ch: usize| -> f32 {
        let (segment, offset) = format.sample_location(frame, ch);
        format
            .sample_format
            .decode(&block.segment(segment)[offset..offset + bps])
    };

    for (frame, out_frame) in dst
        .chunks_exact_mut(out_channels)
        .take(block.frames())
        .enumerate()
    {
        for (ch, out) in out_frame.iter_mut().enumerate() {
            let value = match (in_channels, out_channels) {
                (a, b) if a == b => sample(frame, ch),
                (2, 1) => 0.5 * (sample(frame, 0) + sample(frame, 1)),
                (1, _) => sample(frame, 0),
                _ => {
                    if ch < in_channels {
                        sample(frame, ch)
                    } else {
                        0.0
                    }
                }
            };
            *out += value * gain;
        }
    }
}
