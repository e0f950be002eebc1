//! Local playback: probe a file, open the device at a matching rate, play to the end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bip_player::config::PlaybackConfig;
use bip_player::decode::StreamDecoder;
use bip_player::engine::AudioEngine;
use bip_player::events::PlayerObserver;
use bip_player::output;
use bip_player::pipeline::DecodePipeline;
use bip_player::player::AudioPlayer;
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

/// One file on one device.
#[derive(Clone, Debug)]
pub struct PlayOptions {
    pub path: PathBuf,
    pub device: Option<String>,
    pub playback: PlaybackConfig,
    pub start: f64,
    pub duration: Option<f64>,
    pub preview: bool,
    pub gain: f32,
    pub stats: bool,
}

#[derive(Debug)]
enum RunEvent {
    Finished,
    Failed(String),
    Interrupted,
}

/// Forwards player callbacks to the main thread.
struct ChannelObserver {
    tx: Sender<RunEvent>,
}

impl PlayerObserver for ChannelObserver {
    fn on_position_updated(&self, seconds: f64) {
        tracing::trace!(seconds, "position");
    }

    fn on_end_of_data(&self) {
        let _ = self.tx.try_send(RunEvent::Finished);
    }

    fn on_error(&self, err: &anyhow::Error) {
        let _ = self.tx.try_send(RunEvent::Failed(format!("{err:#}")));
    }
}

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    output::list_devices(&host)
}

pub fn run_play(options: PlayOptions) -> Result<()> {
    let host = cpal::default_host();
    let device_name = normalize_device_name(options.device.clone());
    let device = output::pick_device(&host, device_name.as_deref())?;
    tracing::info!(device = %device.description()?, "output device");

    let decoder = StreamDecoder::open(&options.path)?;
    let info = decoder.info().clone();
    tracing::info!(
        path = %options.path.display(),
        rate_hz = decoder.sample_rate(),
        channels = decoder.channels(),
        codec = info.codec.as_deref().unwrap_or("unknown"),
        container = info.container.as_deref().unwrap_or("unknown"),
        duration_ms = decoder.duration_ms(),
        "source"
    );

    let config = output::pick_output_config(&device, Some(decoder.sample_rate()))?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = output::pick_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }
    let engine = Arc::new(AudioEngine::new(output::engine_config_for(&stream_config, 1)));
    let stream =
        output::build_output_stream(&device, &stream_config, config.sample_format(), &engine)?;
    stream.play().context("start output stream")?;

    let format = engine.input_format();
    let source = DecodePipeline::new(decoder, &format)?;

    let (tx, rx) = crossbeam_channel::bounded(4);
    let interrupt_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(RunEvent::Interrupted);
    })
    .context("install Ctrl-C handler")?;

    let player = AudioPlayer::new(
        "bip-play",
        engine.clone(),
        options.playback.clone(),
        Arc::new(ChannelObserver { tx }),
    )?;
    player.connect(format, Box::new(source))?;
    player.set_gain(options.gain);

    if options.preview {
        player.setup_complete();
        player.play()?;
        player.start_seek();
        player.seek(options.start, options.duration, true);
    } else {
        if options.start > 0.0 || options.duration.is_some() {
            player.seek(options.start, options.duration, false);
        }
        player.setup_complete();
        player.play()?;
    }

    let outcome = wait_for_end(&rx);

    if options.stats {
        println!("{}", serde_json::to_string_pretty(&player.status())?);
    }
    drop(player);
    drop(stream);
    outcome
}

fn wait_for_end(rx: &Receiver<RunEvent>) -> Result<()> {
    match rx.recv() {
        Ok(RunEvent::Finished) => {
            tracing::info!("playback finished");
            Ok(())
        }
        Ok(RunEvent::Interrupted) => {
            tracing::info!("interrupted");
            Ok(())
        }
        Ok(RunEvent::Failed(msg)) => Err(anyhow!("playback failed: {msg}")),
        Err(_) => Err(anyhow!("player event channel closed")),
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
