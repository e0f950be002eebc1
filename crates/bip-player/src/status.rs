use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::bip::SegmentedBipQueue;
use crate::format::AudioFormat;
use crate::reader::ReaderState;
use crate::session::SessionState;

/// Point-in-time view of a player, for logs and `--stats` output.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlayerStatus {
    /// Player identifier.
    pub identifier: String,
    /// User-visible playing state.
    pub playing: bool,
    /// Whether the render callback is delivering audio.
    pub sending: bool,
    /// Media position in seconds.
    pub position_seconds: f64,
    /// Queue sample rate, when connected.
    pub sample_rate: Option<u32>,
    /// Queue channel count, when connected.
    pub channels: Option<usize>,
    /// Reader thread state, when connected.
    pub reader_state: Option<&'static str>,
    /// Frames waiting in the queue.
    pub buffered_frames: u64,
    /// Max frames the queue can hold.
    pub buffer_capacity_frames: u64,
    /// Frames of real audio delivered since the player was created.
    pub frames_rendered: u64,
    /// Number of callbacks that ran short mid-stream.
    pub underrun_events: u64,
    /// Total frames padded with silence because of underruns.
    pub underrun_frames: u64,
}

pub(crate) struct StatusSources<'a> {
    pub identifier: &'a str,
    pub session: &'a SessionState,
    pub format: Option<&'a AudioFormat>,
    pub queue: Option<&'a SegmentedBipQueue>,
    pub reader_state: Option<ReaderState>,
}

impl PlayerStatus {
    pub(crate) fn collect(src: StatusSources<'_>) -> Self {
        let session = src.session;
        let frames_played = session.frames_played.load(Ordering::Relaxed);
        let (buffered_frames, buffer_capacity_frames) = match (src.format, src.queue) {
            (Some(format), Some(queue)) => {
                let bpf = format.bytes_per_frame() as u64;
                (
                    queue.buffered_len() as u64 / bpf,
                    (queue.segment_size() as u64).saturating_sub(1) / bpf,
                )
            }
            _ => (0, 0),
        };
        Self {
            identifier: src.identifier.to_string(),
            playing: session.is_playing.load(Ordering::Relaxed),
            sending: session.is_sending.load(Ordering::Relaxed),
            position_seconds: session.position_seconds(frames_played),
            sample_rate: src.format.map(|f| f.sample_rate),
            channels: src.format.map(|f| f.channels),
            reader_state: src.reader_state.map(ReaderState::as_str),
            buffered_frames,
            buffer_capacity_frames,
            frames_rendered: session.frames_rendered.load(Ordering::Relaxed),
            underrun_events: session.underrun_events.load(Ordering::Relaxed),
            underrun_frames: session.underrun_frames.load(Ordering::Relaxed),
        }
    }
}
