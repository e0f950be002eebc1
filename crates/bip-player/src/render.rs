//! Real-time render callback: turns a player's queue into output blocks.
//!
//! Runs on the output device thread. It never blocks, allocates or logs; everything it needs to
//! report goes out through atomics and `try_send`.
//!
//! While the controller has sending turned off an invocation returns silence without touching
//! the queue, so the controller may reset the queue once any mix already under way is done.
//!
//! Otherwise each invocation:
//! 1. releases the queue span the previous invocation handed out in place,
//! 2. advances the frame index by what the previous invocation delivered, posts a position
//!    update and wakes the reader,
//! 3. delivers the new block: in place when one contiguous span covers it, else by copying,
//!    padding any shortfall with silence.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::bip::{ReadGrant, SegmentedConsumer, SegmentedReadRegion};
use crate::events::{EventKind, EventSender};
use crate::format::AudioFormat;
use crate::reader::ReaderSignal;
use crate::session::SessionState;

/// What a rendered block contains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// Every frame is real audio.
    Audio,
    /// Playback is stopped or has not started yet; the block is all zeros.
    Silence,
    /// The queue ran dry mid-stream; the tail of the block is zero-filled.
    Underrun { missing_frames: usize },
    /// The source ended; whatever was left is followed by zeros.
    EndOfData { missing_frames: usize },
}

/// Scratch output storage, one buffer per queue segment, allocated up front.
pub struct OutputBuffers {
    segments: Vec<Vec<u8>>,
}

impl OutputBuffers {
    pub fn new(format: &AudioFormat, max_frames: usize) -> Self {
        let bytes = max_frames * format.bytes_per_frame();
        Self {
            segments: (0..format.segment_count()).map(|_| vec![0u8; bytes]).collect(),
        }
    }

    /// Bytes each buffer can hold.
    pub fn capacity_bytes(&self) -> usize {
        self.segments.first().map_or(0, Vec::len)
    }

    fn zero(&mut self, from: usize, to: usize) {
        for segment in &mut self.segments {
            segment[from..to].fill(0);
        }
    }
}

enum BlockData<'a> {
    InPlace(SegmentedReadRegion<'a>),
    Copied(&'a OutputBuffers),
}

/// One callback's worth of output.
///
/// Borrowed either straight from the queue or from the caller's [`OutputBuffers`]; either way
/// it stays valid until the next render call.
pub struct RenderedBlock<'a> {
    kind: BlockKind,
    frames: usize,
    bytes: usize,
    data: BlockData<'a>,
}

impl<'a> RenderedBlock<'a> {
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// The engine may skip mixing this block entirely.
    pub fn is_silence(&self) -> bool {
        self.kind == BlockKind::Silence
    }

    /// Whether the block points straight into the player's queue.
    pub fn is_in_place(&self) -> bool {
        matches!(self.data, BlockData::InPlace(_))
    }

    /// Bytes of segment `index` covering exactly [`Self::frames`] frames.
    pub fn segment(&self, index: usize) -> &[u8] {
        match &self.data {
            BlockData::InPlace(region) => &region.segment(index)[..self.bytes],
            BlockData::Copied(buffers) => &buffers.segments[index][..self.bytes],
        }
    }
}

/// Per-player render state, owned by the engine while the player is registered.
pub struct RenderCallback {
    identifier: Arc<str>,
    consumer: SegmentedConsumer,
    format: AudioFormat,
    session: Arc<SessionState>,
    reader: ReaderSignal,
    events: EventSender,
    pending_commit: usize,
    previous_frames: usize,
    frame_index: u64,
    generation: u64,
    end_notified: bool,
}

impl RenderCallback {
    pub(crate) fn new(
        identifier: Arc<str>,
        consumer: SegmentedConsumer,
        format: AudioFormat,
        session: Arc<SessionState>,
        reader: ReaderSignal,
        events: EventSender,
    ) -> Self {
        let generation = session.generation();
        Self {
            identifier,
            consumer,
            format,
            session,
            reader,
            events,
            pending_commit: 0,
            previous_frames: 0,
            frame_index: 0,
            generation,
            end_notified: false,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Frames delivered in the current generation, excluding the block still in flight.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Produce `frames` frames of output.
    ///
    /// Panics if `frames` exceeds what `out` was sized for.
    pub fn render<'a>(&'a mut self, frames: usize, out: &'a mut OutputBuffers) -> RenderedBlock<'a> {
        let bytes_per_frame = self.format.bytes_per_frame();
        let required = frames * bytes_per_frame;
        assert!(
            required <= out.capacity_bytes(),
            "render of {frames} frames exceeds output buffer"
        );

        if !self.session.should_send.load(Ordering::SeqCst) {
            self.session.is_sending.store(false, Ordering::Release);
            out.zero(0, required);
            return copied(BlockKind::Silence, frames, required, out);
        }

        self.sync_generation();

        if self.pending_commit > 0 {
            self.consumer.commit_read(self.pending_commit);
            self.pending_commit = 0;
        }

        if self.previous_frames > 0 {
            self.frame_index += self.previous_frames as u64;
            self.previous_frames = 0;
            self.session
                .frames_played
                .store(self.frame_index, Ordering::Relaxed);
            self.events.send(
                self.generation,
                EventKind::Position {
                    frame_index: self.frame_index,
                },
            );
            self.reader.note_queue_read_complete();
        }

        // loaded before draining: anything committed ahead of the end flag is visible below
        let ended = self.reader.reached_end();

        if let Some(grant) = self.consumer.request_read()
            && grant.len() >= required
        {
            self.session.is_sending.store(true, Ordering::Release);
            self.pending_commit = required;
            self.previous_frames = frames;
            self.session
                .frames_rendered
                .fetch_add(frames as u64, Ordering::Relaxed);
            return RenderedBlock {
                kind: BlockKind::Audio,
                frames,
                bytes: required,
                data: BlockData::InPlace(self.consumer.region(grant)),
            };
        }

        if self.frame_index == 0 && !ended && self.consumer.available() < required {
            // still priming; leave what has arrived for the first full block
            out.zero(0, required);
            return copied(BlockKind::Silence, frames, required, out);
        }

        let copied_bytes = self.copy_available(out, required);
        let copied_frames = copied_bytes / bytes_per_frame;
        self.previous_frames = copied_frames;
        self.session
            .frames_rendered
            .fetch_add(copied_frames as u64, Ordering::Relaxed);

        if copied_bytes == required {
            self.session.is_sending.store(true, Ordering::Release);
            return copied(BlockKind::Audio, frames, required, out);
        }

        out.zero(copied_bytes, required);
        let missing_frames = frames - copied_frames;

        let kind = if ended {
            self.session.is_sending.store(false, Ordering::Release);
            if !self.end_notified {
                self.end_notified = true;
                self.events.send(self.generation, EventKind::EndOfData);
            }
            BlockKind::EndOfData { missing_frames }
        } else {
            self.session.is_sending.store(true, Ordering::Release);
            self.session.underrun_events.fetch_add(1, Ordering::Relaxed);
            self.session
                .underrun_frames
                .fetch_add(missing_frames as u64, Ordering::Relaxed);
            self.events.send(
                self.generation,
                EventKind::Underrun {
                    required_frames: frames,
                    missing_frames,
                },
            );
            BlockKind::Underrun { missing_frames }
        };
        copied(kind, frames, required, out)
    }

    /// Copy up to `required` bytes per segment into `out`, releasing each span as it goes.
    fn copy_available(&mut self, out: &mut OutputBuffers, required: usize) -> usize {
        let mut copied = 0;
        while copied < required {
            let Some(grant) = self.consumer.request_read() else {
                break;
            };
            let take = grant.len().min(required - copied);
            copy_segments(&self.consumer, grant, out, copied, take);
            self.consumer.commit_read(take);
            copied += take;
        }
        copied
    }

    /// Start over after the controller reset the queue and bumped the generation.
    fn sync_generation(&mut self) {
        let generation = self.session.generation();
        if generation == self.generation {
            return;
        }
        self.generation = generation;
        self.pending_commit = 0;
        self.previous_frames = 0;
        self.frame_index = 0;
        self.end_notified = false;
        self.consumer.discard_grant();
        self.session.frames_played.store(0, Ordering::Relaxed);
    }
}

fn copy_segments(
    consumer: &SegmentedConsumer,
    grant: ReadGrant,
    out: &mut OutputBuffers,
    at: usize,
    len: usize,
) {
    let region = consumer.region(grant);
    for (index, dst) in out.segments.iter_mut().enumerate() {
        dst[at..at + len].copy_from_slice(&region.segment(index)[..len]);
    }
}

fn copied(kind: BlockKind, frames: usize, bytes: usize, out: &OutputBuffers) -> RenderedBlock<'_> {
    RenderedBlock {
        kind,
        frames,
        bytes,
        data: BlockData::Copied(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bip::{SegmentedBipQueue, SegmentedProducer};
    use crate::events::{self, PlayerEvent};
    use crate::format::SampleFormat;
    use crossbeam_channel::Receiver;

    // 4 bytes per frame, 4096-byte queue, 256-frame callbacks
    const BLOCK: usize = 256;

    struct Harness {
        callback: RenderCallback,
        producer: SegmentedProducer,
        out: OutputBuffers,
        session: Arc<SessionState>,
        reader: ReaderSignal,
        rx: Receiver<PlayerEvent>,
        next_value: u32,
    }

    fn harness(format: AudioFormat, queue_bytes: usize) -> Harness {
        let (producer, consumer) =
            SegmentedBipQueue::new(queue_bytes / format.segment_count(), format.segment_count());
        let session = Arc::new(SessionState::default());
        session.set_sample_rate(format.sample_rate);
        session.should_send.store(true, Ordering::SeqCst);
        let reader = ReaderSignal::detached();
        let (tx, rx) = events::channel(64);
        let callback = RenderCallback::new(
            Arc::from("test"),
            consumer,
            format,
            session.clone(),
            reader.clone(),
            tx,
        );
        Harness {
            callback,
            producer,
            out: OutputBuffers::new(&format, 1024),
            session,
            reader,
            rx,
            next_value: 1,
        }
    }

    fn stereo_i16() -> AudioFormat {
        AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            sample_format: SampleFormat::I16,
            interleaved: true,
        }
    }

    impl Harness {
        /// Write `bytes` of non-zero audio, frame aligned, straight through the protocol.
        fn produce(&mut self, bytes: usize) -> usize {
            let bpf = self.callback.format.bytes_per_frame();
            let mut written = 0;
            while written < bytes {
                let Some(grant) = self.producer.request_write(bpf) else {
                    break;
                };
                let take = (grant.len() / bpf * bpf).min(bytes - written);
                let mut region = self.producer.region(grant);
                for seg in 0..region.segment_count() {
                    for chunk in region.segment_mut(seg)[..take].chunks_exact_mut(4) {
                        chunk.copy_from_slice(&self.next_value.to_ne_bytes());
                        self.next_value += 1;
                    }
                }
                self.producer.commit_write(take);
                written += take;
            }
            written
        }

        fn render(&mut self, frames: usize) -> (BlockKind, bool, Vec<u8>) {
            let block = self.callback.render(frames, &mut self.out);
            (block.kind(), block.is_in_place(), block.segment(0).to_vec())
        }

        fn events(&self) -> Vec<EventKind> {
            self.rx.try_iter().map(|e| e.kind).collect()
        }
    }

    #[test]
    fn prefilled_queue_delivers_first_block_in_place() {
        let mut h = harness(stereo_i16(), 4096);
        assert_eq!(h.produce(3072), 3072);

        let (kind, in_place, bytes) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::Audio);
        assert!(in_place);
        assert_eq!(bytes.len(), BLOCK * 4);
        assert_eq!(&bytes[..4], &1u32.to_ne_bytes());
        assert!(h.session.is_sending.load(Ordering::SeqCst));
        // nothing committed until the next callback
        assert_eq!(h.producer.queue().buffered_len(), 3072);

        h.render(BLOCK);
        assert_eq!(h.producer.queue().buffered_len(), 2048);
        assert_eq!(h.callback.frame_index(), BLOCK as u64);
    }

    #[test]
    fn starved_stream_reports_underrun() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(BLOCK * 4 * 3);
        for _ in 0..3 {
            assert_eq!(h.render(BLOCK).0, BlockKind::Audio);
        }
        let _ = h.events();

        let (kind, in_place, bytes) = h.render(BLOCK);
        assert_eq!(
            kind,
            BlockKind::Underrun {
                missing_frames: BLOCK
            }
        );
        assert!(!in_place);
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(h.session.underrun_events.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.underrun_frames.load(Ordering::SeqCst), BLOCK as u64);
        assert!(
            h.events()
                .iter()
                .any(|e| matches!(e, EventKind::Underrun { missing_frames, .. } if *missing_frames == BLOCK))
        );
    }

    #[test]
    fn empty_first_callback_is_silent_without_underrun() {
        let mut h = harness(stereo_i16(), 4096);
        let (kind, _, bytes) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::Silence);
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(h.session.underrun_events.load(Ordering::SeqCst), 0);
        assert!(h.events().is_empty());
    }

    #[test]
    fn priming_keeps_partial_data_queued() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(100 * 4);
        let (kind, _, _) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::Silence);
        assert_eq!(h.producer.queue().buffered_len(), 400);

        h.produce(BLOCK * 4);
        let (kind, _, bytes) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::Audio);
        assert_eq!(&bytes[..4], &1u32.to_ne_bytes());
        assert!(h.events().is_empty());
    }

    #[test]
    fn partial_block_is_padded() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(BLOCK * 4);
        h.render(BLOCK);
        h.produce(100 * 4);

        let (kind, _, bytes) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::Underrun { missing_frames: 156 });
        assert!(bytes[..400].iter().any(|&b| b != 0));
        assert!(bytes[400..].iter().all(|&b| b == 0));
    }

    #[test]
    fn wrapped_data_is_copied_not_in_place() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(900 * 4);
        for _ in 0..3 {
            h.render(BLOCK);
        }
        h.render(100);
        // tops up the tail, then wraps to the head
        assert_eq!(h.produce(600 * 4), 600 * 4);

        // 156 frames left in the tail, the rest of the block comes from the head
        let (kind, in_place, bytes) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::Audio);
        assert!(!in_place);
        let values: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let expected: Vec<u32> = (869..869 + BLOCK as u32).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn end_of_data_notifies_once() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(BLOCK * 4);
        h.render(BLOCK);
        h.reader.set_reached_end(true);

        let (kind, _, _) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::EndOfData { missing_frames: BLOCK });
        assert!(!h.session.is_sending.load(Ordering::SeqCst));
        h.render(BLOCK);
        let ends = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, EventKind::EndOfData))
            .count();
        assert_eq!(ends, 1);
    }

    #[test]
    fn end_flag_with_data_still_queued_plays_the_data() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(BLOCK * 4 + 100 * 4);
        h.render(BLOCK);
        h.reader.set_reached_end(true);

        let (kind, _, bytes) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::EndOfData { missing_frames: 156 });
        let values: Vec<u32> = bytes[..400]
            .chunks_exact(4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let expected: Vec<u32> = (BLOCK as u32 + 1..BLOCK as u32 + 101).collect();
        assert_eq!(values, expected);
        assert!(bytes[400..].iter().all(|&b| b == 0));
    }

    #[test]
    fn end_flag_waits_for_every_queued_block() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(BLOCK * 4 * 2 + 40 * 4);
        h.reader.set_reached_end(true);

        assert_eq!(h.render(BLOCK).0, BlockKind::Audio);
        assert_eq!(h.render(BLOCK).0, BlockKind::Audio);
        assert_eq!(
            h.render(BLOCK).0,
            BlockKind::EndOfData {
                missing_frames: BLOCK - 40
            }
        );
        assert_eq!(h.session.underrun_events.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stopped_player_renders_silence_and_clears_sending() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(2048);
        h.render(BLOCK);
        h.session.should_send.store(false, Ordering::SeqCst);

        let (kind, _, bytes) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::Silence);
        assert!(bytes.iter().all(|&b| b == 0));
        assert!(!h.session.is_sending.load(Ordering::SeqCst));
    }

    #[test]
    fn stopped_player_leaves_queue_untouched() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(2048);
        h.render(BLOCK);
        h.session.should_send.store(false, Ordering::SeqCst);

        for _ in 0..3 {
            h.render(BLOCK);
        }
        // the in-place block is still held and nothing new was read
        assert_eq!(h.producer.queue().buffered_len(), 2048);
        assert_eq!(h.callback.frame_index(), 0);
        assert!(h.events().is_empty());

        h.session.should_send.store(true, Ordering::SeqCst);
        let (kind, _, bytes) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::Audio);
        assert_eq!(&bytes[..4], &(BLOCK as u32 + 1).to_ne_bytes());
        assert_eq!(h.callback.frame_index(), BLOCK as u64);
        assert_eq!(h.producer.queue().buffered_len(), 1024);
    }

    #[test]
    fn position_event_follows_delivered_block() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(2048);
        h.render(BLOCK);
        assert!(h.events().is_empty());
        h.render(BLOCK);
        let positions: Vec<u64> = h
            .events()
            .into_iter()
            .filter_map(|e| match e {
                EventKind::Position { frame_index } => Some(frame_index),
                _ => None,
            })
            .collect();
        assert_eq!(positions, vec![BLOCK as u64]);
        assert_eq!(h.session.frames_played.load(Ordering::SeqCst), BLOCK as u64);
    }

    #[test]
    fn new_generation_drops_pending_state() {
        let mut h = harness(stereo_i16(), 4096);
        h.produce(2048);
        h.render(BLOCK);
        h.render(BLOCK);
        assert_eq!(h.callback.frame_index(), BLOCK as u64);

        h.session.should_send.store(false, Ordering::SeqCst);
        h.render(BLOCK);
        // SAFETY: no render is running and the producer holds no region.
        unsafe { h.producer.queue().reset() };
        h.producer.discard_grant();
        h.session.advance_generation();
        h.session.should_send.store(true, Ordering::SeqCst);

        let (kind, _, _) = h.render(BLOCK);
        assert_eq!(kind, BlockKind::Silence);
        assert_eq!(h.callback.frame_index(), 0);
    }

    #[test]
    fn planar_segments_stay_frame_aligned() {
        let format = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            sample_format: SampleFormat::F32,
            interleaved: false,
        };
        let mut h = harness(format, 8192);
        h.produce(BLOCK * 4 * 2);
        let block = h.callback.render(BLOCK, &mut h.out);
        assert_eq!(block.kind(), BlockKind::Audio);
        assert_eq!(block.segment(0).len(), BLOCK * 4);
        assert_eq!(block.segment(1).len(), BLOCK * 4);
    }
}
