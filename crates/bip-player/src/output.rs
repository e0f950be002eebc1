//! Output device selection and the CPAL stream that clocks an [`AudioEngine`].
//!
//! The stream callback is the hardware-driven entry point: it mixes every registered
//! player into a preallocated `f32` scratch buffer and converts it to the device format.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

use crate::config::EngineConfig;
use crate::engine::AudioEngine;

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let Some(needle) = needle else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device"));
    };

    host.output_devices()
        .context("No output devices")?
        .find(|d| {
            d.description()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        })
        .ok_or_else(|| anyhow!("No output device matched: {needle}"))
}

/// Choose an output config for `target_rate`, or the highest supported rate when unset.
///
/// Rates at or below the target win over rates above it; ties go to the higher rate, then
/// to `f32` over integer formats.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;

    for range in device.supported_output_configs()? {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            below: target_rate.is_none_or(|t| rate <= t),
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        if best.as_ref().is_none_or(|(b, _)| candidate.is_better_than(b)) {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Largest fixed buffer size the device allows (capped), or `None` for the device default.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Print available output devices to stdout (`--list-devices`).
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    Ok(())
}

/// Engine settings matching a device stream config.
///
/// `max_output_frames` follows a fixed buffer size when there is one.
pub fn engine_config_for(config: &cpal::StreamConfig, max_players: usize) -> EngineConfig {
    let defaults = EngineConfig::default();
    let max_output_frames = match config.buffer_size {
        cpal::BufferSize::Fixed(frames) if frames > 0 => frames as usize,
        _ => defaults.max_output_frames,
    };
    EngineConfig {
        sample_rate: config.sample_rate,
        channels: config.channels as usize,
        max_output_frames,
        max_players,
    }
}

/// Build a CPAL output stream that pulls mixed audio from `engine`.
///
/// The engine's channel count must match `config.channels`.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    engine: &Arc<AudioEngine>,
) -> Result<cpal::Stream> {
    if engine.config().channels != config.channels as usize {
        return Err(anyhow!(
            "engine has {} channels, stream has {}",
            engine.config().channels,
            config.channels
        ));
    }
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, engine),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, engine),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, engine),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, engine),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    engine: &Arc<AudioEngine>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let engine_cb = engine.clone();
    // sized for the largest fixed buffer; a bigger callback is mixed in pieces
    let mut scratch = vec![0.0f32; engine.max_output_frames().max(1) * channels * 4];

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            for out in data.chunks_mut(scratch.len()) {
                let mixed = &mut scratch[..out.len()];
                engine_cb.mix_into(mixed);
                for (dst, &src) in out.iter_mut().zip(mixed.iter()) {
                    *dst = <T as cpal::Sample>::from_sample::<f32>(src);
                }
            }
        },
        err_fn,
        None,
    )?;

    tracing::info!(
        rate_hz = config.sample_rate,
        channels,
        "output stream built"
    );
    Ok(stream)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Candidate {
    below: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, other: &Candidate) -> bool {
        if self.below != other.below {
            self.below
        } else if self.rate != other.rate {
            self.rate > other.rate
        } else {
            self.format_rank < other.format_rank
        }
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(below: bool, rate: u32, format_rank: u8) -> Candidate {
        Candidate {
            below,
            rate,
            format_rank,
        }
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", " USB "));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn pick_rate_for_range_clamps_to_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(48_000)), 48_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(22_050)), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(192_000)), 96_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, None), 96_000);
    }

    #[test]
    fn candidates_prefer_below_then_rate_then_format() {
        assert!(candidate(true, 48_000, 1).is_better_than(&candidate(false, 48_000, 1)));
        assert!(candidate(true, 96_000, 2).is_better_than(&candidate(true, 48_000, 2)));
        assert!(candidate(true, 48_000, 0).is_better_than(&candidate(true, 48_000, 2)));
        assert!(!candidate(true, 48_000, 2).is_better_than(&candidate(true, 48_000, 2)));
    }

    #[test]
    fn engine_config_follows_stream() {
        let config = cpal::StreamConfig {
            channels: 2,
            sample_rate: 44_100,
            buffer_size: cpal::BufferSize::Fixed(256),
        };
        let engine = engine_config_for(&config, 4);
        assert_eq!(engine.sample_rate, 44_100);
        assert_eq!(engine.channels, 2);
        assert_eq!(engine.max_output_frames, 256);
        assert_eq!(engine.max_players, 4);

        let config = cpal::StreamConfig {
            buffer_size: cpal::BufferSize::Default,
            ..config
        };
        assert_eq!(
            engine_config_for(&config, 1).max_output_frames,
            EngineConfig::default().max_output_frames
        );
    }
}
