//! Upstream audio sources and the frame destination they write into.

use std::fmt;

use crate::bip::SegmentedWriteRegion;
use crate::format::AudioFormat;

/// Where a source should produce from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MediaPosition {
    /// Seek to this many seconds from the start of the media, then produce.
    FromStart(f64),
    /// Continue from wherever the previous call stopped.
    Current,
}

/// Why a source stopped producing.
#[derive(Debug)]
pub enum SourceError {
    /// No more audio. Not reported as a failure.
    EndOfData,
    /// Anything else; surfaced to the player's observer.
    Failed(anyhow::Error),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::EndOfData => f.write_str("end of data"),
            SourceError::Failed(err) => write!(f, "source failed: {err:#}"),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceError::EndOfData => None,
            SourceError::Failed(err) => Some(&**err),
        }
    }
}

impl From<anyhow::Error> for SourceError {
    fn from(err: anyhow::Error) -> Self {
        SourceError::Failed(err)
    }
}

/// Pull-style audio producer driven by a player's reader thread.
///
/// Implementations decode, synthesize or otherwise generate audio in the player's
/// [`AudioFormat`] and write it into `frames`. Frames written before an error is returned are
/// still queued.
pub trait AudioSource: Send {
    /// Fill some or all of `frames`, starting at `position`.
    fn produce(
        &mut self,
        position: MediaPosition,
        frames: &mut AudioFrames<'_>,
    ) -> Result<(), SourceError>;

    /// Drop any internally buffered audio ahead of a seek.
    fn reset(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writable window into a player queue, measured in whole frames.
pub struct AudioFrames<'a> {
    region: SegmentedWriteRegion<'a>,
    format: AudioFormat,
    capacity: usize,
    written: usize,
}

impl<'a> AudioFrames<'a> {
    pub(crate) fn new(region: SegmentedWriteRegion<'a>, format: AudioFormat, max_frames: usize) -> Self {
        let capacity = (region.len() / format.bytes_per_frame()).min(max_frames);
        Self {
            region,
            format,
            capacity,
            written: 0,
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Frames this window can take in total.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.written
    }

    pub fn is_full(&self) -> bool {
        self.written == self.capacity
    }

    /// Append interleaved `f32` samples with the format's channel count.
    ///
    /// Returns the number of whole frames accepted; a trailing partial frame is ignored.
    pub fn push_interleaved(&mut self, samples: &[f32]) -> usize {
        let channels = self.format.channels;
        let bps = self.format.sample_format.bytes_per_sample();
        let frames = (samples.len() / channels).min(self.remaining());

        for (i, frame) in samples.chunks_exact(channels).take(frames).enumerate() {
            let frame_index = self.written + i;
            for (ch, &sample) in frame.iter().enumerate() {
                let (segment, offset) = self.format.sample_location(frame_index, ch);
                let dst = &mut self.region.segment_mut(segment)[offset..offset + bps];
                self.format.sample_format.encode(sample, dst);
            }
        }
        self.written += frames;
        frames
    }

    /// Append `frames` frames of digital silence.
    pub fn push_silence(&mut self, frames: usize) -> usize {
        let frames = frames.min(self.remaining());
        let bpf = self.format.bytes_per_frame();
        let start = self.written * bpf;
        for segment in 0..self.format.segment_count() {
            self.region.segment_mut(segment)[start..start + frames * bpf].fill(0);
        }
        self.written += frames;
        frames
    }
}
