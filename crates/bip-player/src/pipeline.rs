//! File playback source: decode → resample → channel map, pulled by a player's reader thread.

use std::path::Path;

use anyhow::Result;

use crate::decode::StreamDecoder;
use crate::format::AudioFormat;
use crate::resample::StreamResampler;
use crate::source::{AudioFrames, AudioSource, MediaPosition, SourceError};

/// Resampler input chunk size in frames.
const RESAMPLE_CHUNK_FRAMES: usize = 1024;

/// [`AudioSource`] that decodes a media file into the player's format.
pub struct DecodePipeline {
    decoder: StreamDecoder,
    resampler: Option<StreamResampler>,
    src_channels: usize,
    dst_channels: usize,
    decoded: Vec<f32>,
    resampled: Vec<f32>,
    pending: Vec<f32>,
    pending_pos: usize,
    flushed: bool,
    finished: bool,
}

impl DecodePipeline {
    pub fn open(path: &Path, target: &AudioFormat) -> Result<Self> {
        Self::new(StreamDecoder::open(path)?, target)
    }

    /// Wrap an already probed decoder, resampling to `target.sample_rate` when needed.
    pub fn new(decoder: StreamDecoder, target: &AudioFormat) -> Result<Self> {
        let src_channels = decoder.channels();
        let resampler = if decoder.sample_rate() != target.sample_rate {
            tracing::info!(
                from_hz = decoder.sample_rate(),
                to_hz = target.sample_rate,
                "resampling enabled"
            );
            Some(StreamResampler::new(
                decoder.sample_rate(),
                target.sample_rate,
                src_channels,
                RESAMPLE_CHUNK_FRAMES,
            )?)
        } else {
            None
        };
        Ok(Self {
            decoder,
            resampler,
            src_channels,
            dst_channels: target.channels,
            decoded: Vec::new(),
            resampled: Vec::new(),
            pending: Vec::new(),
            pending_pos: 0,
            flushed: false,
            finished: false,
        })
    }

    pub fn decoder(&self) -> &StreamDecoder {
        &self.decoder
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.decoder.duration_ms().map(|ms| ms as f64 / 1000.0)
    }

    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        self.clear_buffers()?;
        self.decoder.seek(seconds)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.pending.clear();
        self.pending_pos = 0;
        self.flushed = false;
        self.finished = false;
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset()?;
        }
        Ok(())
    }

    /// Load the next batch of output-format samples into `pending`.
    ///
    /// Returns `Ok(false)` once the decoder and resampler are both drained.
    fn refill(&mut self) -> Result<bool> {
        loop {
            self.resampled.clear();
            let more = self.decoder.next_chunk(&mut self.decoded)?;
            let at_rate: &[f32] = match self.resampler.as_mut() {
                Some(resampler) if more => {
                    resampler.push(&self.decoded, &mut self.resampled)?;
                    &self.resampled
                }
                Some(resampler) if !self.flushed => {
                    self.flushed = true;
                    resampler.flush(&mut self.resampled)?;
                    &self.resampled
                }
                Some(_) => return Ok(false),
                None if more => &self.decoded,
                None => return Ok(false),
            };
            if at_rate.is_empty() {
                if more {
                    continue;
                }
                return Ok(false);
            }
            map_channels(at_rate, self.src_channels, self.dst_channels, &mut self.pending);
            self.pending_pos = 0;
            return Ok(true);
        }
    }
}

impl AudioSource for DecodePipeline {
    fn produce(
        &mut self,
        position: MediaPosition,
        frames: &mut AudioFrames<'_>,
    ) -> Result<(), SourceError> {
        if let MediaPosition::FromStart(seconds) = position {
            self.seek(seconds)?;
        }

        while !frames.is_full() {
            if self.pending_pos >= self.pending.len() {
                if self.finished || !self.refill()? {
                    self.finished = true;
                    break;
                }
            }
            let accepted = frames.push_interleaved(&self.pending[self.pending_pos..]);
            self.pending_pos += accepted * self.dst_channels;
        }

        if frames.written() == 0 && self.finished {
            return Err(SourceError::EndOfData);
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.clear_buffers()
    }
}

/// Map interleaved samples between channel counts into `out` (cleared first).
///
/// Mono and stereo are converted both ways; other mismatches keep the leading channels and
/// pad with silence.
pub fn map_channels(input: &[f32], src_channels: usize, dst_channels: usize, out: &mut Vec<f32>) {
    out.clear();
    if src_channels == dst_channels {
        out.extend_from_slice(input);
        return;
    }
    for frame in input.chunks_exact(src_channels) {
        for ch in 0..dst_channels {
            let value = match (src_channels, dst_channels) {
                (2, 1) => 0.5 * (frame[0] + frame[1]),
                (1, _) => frame[0],
                _ => frame.get(ch).copied().unwrap_or(0.0),
            };
            out.push(value);
        }
    }
}
