//! PCM layout descriptions and per-sample byte encoding.

use std::fmt;

/// Sample encoding stored in player queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::I16 => 2,
        }
    }

    /// Encode one sample (nominal range -1.0..=1.0) into `dst`, native endian.
    #[inline]
    pub fn encode(self, sample: f32, dst: &mut [u8]) {
        match self {
            SampleFormat::F32 => dst[..4].copy_from_slice(&sample.to_ne_bytes()),
            SampleFormat::I16 => {
                let v = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                dst[..2].copy_from_slice(&v.to_ne_bytes());
            }
        }
    }

    #[inline]
    pub fn decode(self, src: &[u8]) -> f32 {
        match self {
            SampleFormat::F32 => f32::from_ne_bytes([src[0], src[1], src[2], src[3]]),
            SampleFormat::I16 => i16::from_ne_bytes([src[0], src[1]]) as f32 / i16::MAX as f32,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::F32 => f.write_str("f32"),
            SampleFormat::I16 => f.write_str("i16"),
        }
    }
}

/// Layout of the audio a player queues and hands to the engine.
///
/// Interleaved audio lives in a single queue segment with `channels` samples per frame.
/// Non-interleaved audio uses one segment per channel, one sample per frame in each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: usize,
    pub sample_format: SampleFormat,
    pub interleaved: bool,
}

impl AudioFormat {
    /// Bytes one frame occupies in each queue segment.
    pub fn bytes_per_frame(&self) -> usize {
        if self.interleaved {
            self.sample_format.bytes_per_sample() * self.channels
        } else {
            self.sample_format.bytes_per_sample()
        }
    }

    pub fn segment_count(&self) -> usize {
        if self.interleaved { 1 } else { self.channels }
    }

    /// Whole frames in `seconds`, rounded down. Negative or non-finite input yields 0.
    pub fn frames_for_seconds(&self, seconds: f64) -> u64 {
        if !seconds.is_finite() || seconds <= 0.0 {
            return 0;
        }
        (seconds * self.sample_rate as f64) as u64
    }

    pub fn seconds_for_frames(&self, frames: u64) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 / self.sample_rate as f64
    }

    /// Byte offset of (`frame`, `channel`) and the segment holding it.
    #[inline]
    pub fn sample_location(&self, frame: usize, channel: usize) -> (usize, usize) {
        let bps = self.sample_format.bytes_per_sample();
        if self.interleaved {
            (0, (frame * self.channels + channel) * bps)
        } else {
            (channel, frame * bps)
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}, {}",
            self.sample_rate,
            self.channels,
            self.sample_format,
            if self.interleaved { "interleaved" } else { "planar" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(interleaved: bool, sample_format: SampleFormat) -> AudioFormat {
        AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            sample_format,
            interleaved,
        }
    }

    #[test]
    fn interleaved_layout_uses_one_segment() {
        let fmt = format(true, SampleFormat::I16);
        assert_eq!(fmt.bytes_per_frame(), 4);
        assert_eq!(fmt.segment_count(), 1);
        assert_eq!(fmt.sample_location(3, 1), (0, 14));
    }

    #[test]
    fn planar_layout_uses_segment_per_channel() {
        let fmt = format(false, SampleFormat::F32);
        assert_eq!(fmt.bytes_per_frame(), 4);
        assert_eq!(fmt.segment_count(), 2);
        assert_eq!(fmt.sample_location(3, 1), (1, 12));
    }

    #[test]
    fn frames_for_seconds_rounds_down() {
        let fmt = format(true, SampleFormat::F32);
        assert_eq!(fmt.frames_for_seconds(0.5), 24_000);
        assert_eq!(fmt.frames_for_seconds(-1.0), 0);
        assert_eq!(fmt.frames_for_seconds(f64::NAN), 0);
        assert_eq!(fmt.seconds_for_frames(96_000), 2.0);
    }

    #[test]
    fn i16_encoding_clamps() {
        let mut buf = [0u8; 2];
        SampleFormat::I16.encode(2.0, &mut buf);
        assert_eq!(i16::from_ne_bytes(buf), i16::MAX);
        assert!((SampleFormat::I16.decode(&buf) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn f32_encoding_is_lossless() {
        let mut buf = [0u8; 4];
        SampleFormat::F32.encode(-0.25, &mut buf);
        assert_eq!(SampleFormat::F32.decode(&buf), -0.25);
    }
}
