//! Pull-style audio decoding.
//!
//! Uses Symphonia to:
//! - probe the input container/codec
//! - decode packets into interleaved `f32` samples on demand
//! - seek accurately, trimming the frames a coarse container seek lands before the target

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

/// Metadata captured while probing the source.
#[derive(Clone, Debug, Default)]
pub struct SourceInfo {
    /// Codec name (best-effort).
    pub codec: Option<String>,
    /// Source bit depth (best-effort).
    pub bit_depth: Option<u16>,
    /// Container/extension hint (best-effort).
    pub container: Option<String>,
}

/// Decoder for a single audio track, driven by the caller one packet at a time.
pub struct StreamDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    duration_ms: Option<u64>,
    info: SourceInfo,
    skip_frames: u64,
}

impl StreamDecoder {
    /// Open a local file, using its extension as a probe hint.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;

        let mut hint = Hint::new();
        let ext = path.extension().and_then(|e| e.to_str());
        if let Some(ext) = ext {
            hint.with_extension(ext);
        }

        let mut decoder = Self::from_media_source(Box::new(file), hint)
            .with_context(|| format!("probe {:?}", path))?;
        decoder.info.container = ext.map(str::to_ascii_uppercase);
        Ok(decoder)
    }

    /// Probe an arbitrary Symphonia [`MediaSource`] and prepare its default track.
    pub fn from_media_source(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(source, Default::default());

        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("No default audio track"))?;
        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| anyhow!("Unknown channels"))?
            .count();
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;

        let codec_params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;
        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .context("create decoder")?;

        let info = SourceInfo {
            codec: codec_name_from_params(&codec_params),
            bit_depth: codec_params
                .bits_per_sample
                .or(codec_params.bits_per_coded_sample)
                .and_then(|v| u16::try_from(v).ok()),
            container: None,
        };

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            duration_ms: duration_ms_from_codec_params(&codec_params),
            info,
            skip_frames: 0,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    /// Decode the next packet into `out` (cleared first) as interleaved `f32`.
    ///
    /// Returns `Ok(false)` at end of stream. Corrupt packets are skipped.
    pub fn next_chunk(&mut self, out: &mut Vec<f32>) -> Result<bool> {
        out.clear();
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(e).context("read packet"),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(msg)) => {
                    tracing::debug!("skipping undecodable packet: {msg}");
                    continue;
                }
                Err(e) => return Err(e).context("decode packet"),
            };

            let frames = decoded.frames();
            let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);

            let skip = (self.skip_frames.min(frames as u64)) as usize;
            self.skip_frames -= skip as u64;
            let samples = &sample_buf.samples()[skip * self.channels..];
            if samples.is_empty() {
                continue;
            }
            out.extend_from_slice(samples);
            return Ok(true);
        }
    }

    /// Seek to `seconds` from the start of the track.
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        let seconds = seconds.max(0.0);
        let whole = seconds.trunc() as u64;
        let time = Time::new(whole, seconds - whole as f64);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .with_context(|| format!("seek to {seconds:.3}s"))?;
        self.decoder.reset();
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        Ok(())
    }
}

/// Best-effort duration in milliseconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label for logs and status.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use symphonia::core::codecs::*;

    fn wav_decoder(frames: u32) -> StreamDecoder {
        let bytes = testing::wav_bytes(8_000, 2, frames);
        let mut hint = Hint::new();
        hint.with_extension("wav");
        StreamDecoder::from_media_source(Box::new(Cursor::new(bytes)), hint).unwrap()
    }

    #[test]
    fn duration_ms_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_ms_from_codec_params(&params).is_none());
    }

    #[test]
    fn duration_ms_from_codec_params_computes() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(duration_ms_from_codec_params(&params), Some(2000));
    }

    #[test]
    fn codec_name_from_params_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_name_from_params(&params), Some("FLAC".to_string()));
        params.codec = CODEC_TYPE_PCM_S16LE;
        assert_eq!(codec_name_from_params(&params), Some("PCM_S16".to_string()));
    }

    #[test]
    fn decodes_wav_to_end() {
        let mut decoder = wav_decoder(4_000);
        assert_eq!(decoder.sample_rate(), 8_000);
        assert_eq!(decoder.channels(), 2);
        assert_eq!(decoder.duration_ms(), Some(500));
        assert_eq!(decoder.info().codec.as_deref(), Some("PCM_S16"));

        let mut total = 0;
        let mut chunk = Vec::new();
        while decoder.next_chunk(&mut chunk).unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, 4_000 * 2);
    }

    #[test]
    fn seek_lands_on_requested_frame() {
        let mut decoder = wav_decoder(8_000);
        decoder.seek(0.5).unwrap();

        let mut total = 0;
        let mut chunk = Vec::new();
        while decoder.next_chunk(&mut chunk).unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, 4_000 * 2);
    }
}
