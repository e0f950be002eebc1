//! bip-play: plays one audio file through a bip-queue player.
//!
//! ## Pipeline
//! 1. **Read ahead**: a reader thread decodes (Symphonia), resamples (Rubato) if the file rate
//!    differs from the device, and fills the player's queue.
//! 2. **Render**: the CPAL callback mixes the player's queue into the device buffer without
//!    blocking.
//!
//! The queue holds `--buffer-seconds` of audio.

mod cli;
mod runtime;

use anyhow::{Result, anyhow};
use bip_player::config::PlaybackConfig;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,bip_player=info,bip_play=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let path = args.path.ok_or_else(|| anyhow!("missing audio file path"))?;
    runtime::run_play(runtime::PlayOptions {
        path,
        device: args.device,
        playback: PlaybackConfig {
            buffer_seconds: args.buffer_seconds,
            ..PlaybackConfig::default()
        },
        start: args.start,
        duration: args.duration,
        preview: args.preview,
        gain: args.gain,
        stats: args.stats,
    })
}
