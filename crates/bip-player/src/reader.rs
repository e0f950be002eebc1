//! Reader (producer) thread: keeps a player's queue topped up from its [`AudioSource`].
//!
//! States:
//! - `Starting`: just spawned; moves to `Reading` if `resume` already arrived, else `Waiting`.
//! - `Waiting`: parked until signalled; moves to `Reading` unless a stop is pending.
//! - `Reading`: fills the queue until it is full, the source ends, or a stop is requested.
//!
//! The render callback wakes the reader after it frees queue space. That wake-up is a single
//! atomic permit plus `Thread::unpark`, so the real-time side never takes a lock. State edges
//! are published under a mutex so the controller can wait for the reader to go idle before
//! resetting the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, Thread};

use anyhow::{Context, Result};

use crate::bip::SegmentedProducer;
use crate::events::{EventKind, EventSender};
use crate::format::AudioFormat;
use crate::session::SessionState;
use crate::source::{AudioFrames, AudioSource, MediaPosition, SourceError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    Starting,
    Waiting,
    Reading,
}

impl ReaderState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReaderState::Starting => "starting",
            ReaderState::Waiting => "waiting",
            ReaderState::Reading => "reading",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct SeekRequest {
    seconds: f64,
    max_frames: Option<u64>,
}

#[derive(Debug)]
struct ReaderControl {
    state: ReaderState,
    resume_requested: bool,
    pending_seek: Option<SeekRequest>,
}

pub(crate) struct ReaderShared {
    control: Mutex<ReaderControl>,
    state_changed: Condvar,
    stop_requested: AtomicBool,
    shutdown: AtomicBool,
    reached_end: AtomicBool,
    permit: AtomicBool,
    thread: OnceLock<Thread>,
}

impl ReaderShared {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(ReaderControl {
                state: ReaderState::Starting,
                resume_requested: false,
                pending_seek: None,
            }),
            state_changed: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            reached_end: AtomicBool::new(false),
            permit: AtomicBool::new(false),
            thread: OnceLock::new(),
        }
    }

    fn control(&self) -> MutexGuard<'_, ReaderControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake the reader. Lock-free; safe on the render thread.
    fn signal(&self) {
        self.permit.store(true, Ordering::Release);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Block the reader thread until signalled (or shut down).
    fn wait(&self) {
        while !self.permit.swap(false, Ordering::AcqRel) {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            thread::park();
        }
    }

    fn publish(&self, control: &mut ReaderControl, state: ReaderState) {
        if control.state != state {
            control.state = state;
            self.state_changed.notify_all();
        }
    }
}

/// Render-side handle to a reader: lets the callback wake it and ask whether the source ended.
#[derive(Clone)]
pub(crate) struct ReaderSignal {
    shared: Arc<ReaderShared>,
}

impl ReaderSignal {
    #[cfg(test)]
    pub fn detached() -> Self {
        Self {
            shared: Arc::new(ReaderShared::new()),
        }
    }

    /// The callback consumed queue data; the reader may have room to fill.
    pub fn note_queue_read_complete(&self) {
        self.shared.signal();
    }

    pub fn reached_end(&self) -> bool {
        self.shared.reached_end.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn set_reached_end(&self, value: bool) {
        self.shared.reached_end.store(value, Ordering::Release);
    }
}

/// Everything the reader thread owns.
pub(crate) struct ReaderTask {
    pub identifier: Arc<str>,
    pub producer: SegmentedProducer,
    pub source: Box<dyn AudioSource>,
    pub format: AudioFormat,
    /// Target frames per fill: the engine's max callback size times the read-ahead factor.
    pub read_ahead_frames: usize,
    pub session: Arc<SessionState>,
    pub events: EventSender,
}

/// Controller handle for a running reader thread.
pub(crate) struct ReaderThread {
    shared: Arc<ReaderShared>,
    join: Option<JoinHandle<()>>,
}

impl ReaderThread {
    pub fn spawn(task: ReaderTask) -> Result<Self> {
        let shared = Arc::new(ReaderShared::new());
        let name = format!("{}-reader", task.identifier);
        let worker = ReaderWorker {
            shared: shared.clone(),
            task,
            position: MediaPosition::FromStart(0.0),
            frames_remaining: u64::MAX,
        };
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())
            .context("spawn reader thread")?;
        Ok(Self {
            shared,
            join: Some(join),
        })
    }

    pub fn signal(&self) -> ReaderSignal {
        ReaderSignal {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> ReaderState {
        self.shared.control().state
    }

    pub fn reached_end(&self) -> bool {
        self.shared.reached_end.load(Ordering::Acquire)
    }

    /// Reposition the source. Takes effect the next time the reader enters `Reading`.
    ///
    /// `max_frames` bounds how much is read after the seek (`None` reads to the end).
    /// Clears the end-of-data flag immediately.
    pub fn seek(&self, seconds: f64, max_frames: Option<u64>) {
        let mut control = self.shared.control();
        control.pending_seek = Some(SeekRequest {
            seconds: seconds.max(0.0),
            max_frames,
        });
        self.shared.reached_end.store(false, Ordering::Release);
    }

    /// Let the reader start (or restart) filling the queue.
    pub fn resume(&self) {
        {
            let mut control = self.shared.control();
            control.resume_requested = true;
            self.shared.stop_requested.store(false, Ordering::SeqCst);
        }
        self.shared.signal();
    }

    /// Ask the reader to stop and block until it is parked in `Waiting`.
    ///
    /// Once this returns the reader does not touch the queue again until [`Self::resume`].
    pub fn stop_reading(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.signal();
        let mut control = self.shared.control();
        control.resume_requested = false;
        while control.state != ReaderState::Waiting && !self.is_finished() {
            control = self
                .shared
                .state_changed
                .wait(control)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop the thread and join it. Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.signal();
        {
            // wake a controller blocked in stop_reading on another thread
            let _control = self.shared.control();
            self.shared.state_changed.notify_all();
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!("reader thread panicked");
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

impl Drop for ReaderThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ReaderWorker {
    shared: Arc<ReaderShared>,
    task: ReaderTask,
    position: MediaPosition,
    frames_remaining: u64,
}

impl ReaderWorker {
    fn run(mut self) {
        let shared = self.shared.clone();
        let _ = shared.thread.set(thread::current());
        tracing::debug!(player = %self.task.identifier, "reader thread started");

        let mut state = ReaderState::Starting;
        while !shared.shutdown.load(Ordering::Acquire) {
            state = match state {
                ReaderState::Starting => {
                    let mut control = shared.control();
                    let next = if control.resume_requested {
                        self.enter_reading(&mut control);
                        ReaderState::Reading
                    } else {
                        ReaderState::Waiting
                    };
                    shared.publish(&mut control, next);
                    next
                }
                ReaderState::Waiting => {
                    shared.wait();
                    let mut control = shared.control();
                    if shared.shutdown.load(Ordering::Acquire)
                        || shared.stop_requested.load(Ordering::SeqCst)
                        || !control.resume_requested
                    {
                        ReaderState::Waiting
                    } else {
                        self.enter_reading(&mut control);
                        shared.publish(&mut control, ReaderState::Reading);
                        ReaderState::Reading
                    }
                }
                ReaderState::Reading => {
                    if shared.stop_requested.load(Ordering::SeqCst) || !self.try_read() {
                        let mut control = shared.control();
                        shared.publish(&mut control, ReaderState::Waiting);
                        ReaderState::Waiting
                    } else {
                        ReaderState::Reading
                    }
                }
            };
        }

        let mut control = shared.control();
        shared.publish(&mut control, ReaderState::Waiting);
        tracing::debug!(player = %self.task.identifier, "reader thread stopped");
    }

    /// Apply any pending seek on the way into `Reading`.
    fn enter_reading(&mut self, control: &mut ReaderControl) {
        let Some(seek) = control.pending_seek.take() else {
            return;
        };
        self.task.producer.discard_grant();
        if let Err(err) = self.task.source.reset() {
            tracing::warn!(player = %self.task.identifier, "source reset failed: {err:#}");
        }
        self.position = MediaPosition::FromStart(seek.seconds);
        self.frames_remaining = seek.max_frames.unwrap_or(u64::MAX);
    }

    /// Produce one chunk into the queue. Returns `false` when the reader should wait.
    fn try_read(&mut self) -> bool {
        if self.frames_remaining == 0 {
            self.shared.reached_end.store(true, Ordering::Release);
            return false;
        }

        let bytes_per_frame = self.task.format.bytes_per_frame();
        // an empty queue can always grant half its usable bytes in one contiguous span
        let grantable_frames =
            ((self.task.producer.segment_size() - 1) / 2 / bytes_per_frame).max(1);
        let target_frames = (self.task.read_ahead_frames.min(grantable_frames) as u64)
            .min(self.frames_remaining) as usize;
        let Some(grant) = self
            .task
            .producer
            .request_write(target_frames * bytes_per_frame)
        else {
            return false;
        };

        let mut frames = AudioFrames::new(
            self.task.producer.region(grant),
            self.task.format,
            target_frames,
        );
        let result = self.task.source.produce(self.position, &mut frames);
        let written = frames.written();
        drop(frames);

        self.task.producer.commit_write(written * bytes_per_frame);
        if written > 0 {
            self.position = MediaPosition::Current;
            self.frames_remaining = self.frames_remaining.saturating_sub(written as u64);
        }

        match result {
            Ok(()) => written > 0,
            Err(SourceError::EndOfData) => {
                self.shared.reached_end.store(true, Ordering::Release);
                false
            }
            Err(SourceError::Failed(err)) => {
                self.shared.reached_end.store(true, Ordering::Release);
                let generation = self.task.session.generation();
                self.task.events.send(generation, EventKind::Error(err));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bip::{SegmentedBipQueue, SegmentedConsumer};
    use crate::events;
    use crate::format::SampleFormat;
    use crate::source::testing::RampSource;
    use std::time::{Duration, Instant};

    fn mono_f32() -> AudioFormat {
        AudioFormat {
            sample_rate: 1_000,
            channels: 1,
            sample_format: SampleFormat::F32,
            interleaved: true,
        }
    }

    fn spawn_reader(
        source: RampSource,
        queue_frames: usize,
    ) -> (ReaderThread, SegmentedConsumer, crossbeam_channel::Receiver<events::PlayerEvent>) {
        spawn_reader_with(source, queue_frames, 16)
    }

    fn spawn_reader_with(
        source: RampSource,
        queue_frames: usize,
        read_ahead_frames: usize,
    ) -> (ReaderThread, SegmentedConsumer, crossbeam_channel::Receiver<events::PlayerEvent>) {
        let format = mono_f32();
        let (producer, consumer) =
            SegmentedBipQueue::new(queue_frames * format.bytes_per_frame(), 1);
        let (tx, rx) = events::channel(16);
        let reader = ReaderThread::spawn(ReaderTask {
            identifier: Arc::from("test"),
            producer,
            source: Box::new(source),
            format,
            read_ahead_frames,
            session: Arc::new(SessionState::default()),
            events: tx,
        })
        .unwrap();
        (reader, consumer, rx)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn drain(consumer: &mut SegmentedConsumer) -> Vec<f32> {
        let mut out = Vec::new();
        while let Some(grant) = consumer.request_read() {
            let region = consumer.region(grant);
            out.extend(
                region
                    .segment(0)
                    .chunks_exact(4)
                    .map(|b| SampleFormat::F32.decode(b)),
            );
            consumer.commit_read(grant.len());
        }
        out
    }

    #[test]
    fn idle_until_resumed() {
        let (reader, consumer, _rx) = spawn_reader(RampSource::new(1_000, 1_000), 64);
        wait_until(|| reader.state() == ReaderState::Waiting);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(consumer.queue().buffered_len(), 0);
    }

    #[test]
    fn fills_queue_then_waits() {
        let (reader, consumer, _rx) = spawn_reader(RampSource::new(10_000, 1_000), 64);
        reader.resume();
        // 16-frame chunks: the fourth no longer fits next to the slack byte
        wait_until(|| consumer.queue().buffered_len() == 48 * 4);
        wait_until(|| reader.state() == ReaderState::Waiting);
        assert!(!reader.reached_end());
    }

    #[test]
    fn read_ahead_larger_than_queue_still_fills() {
        // 400 frames of read-ahead against a 250 frame queue
        let (reader, mut consumer, _rx) =
            spawn_reader_with(RampSource::new(1_000, 1_000), 250, 400);
        let signal = reader.signal();
        reader.resume();

        wait_until(|| consumer.queue().buffered_len() > 0);
        let mut seen = Vec::new();
        wait_until(|| {
            seen.extend(drain(&mut consumer));
            signal.note_queue_read_complete();
            seen.len() == 1_000
        });
        let expected: Vec<f32> = (0..1_000).map(RampSource::value_for).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn refills_after_signal_in_order() {
        let (reader, mut consumer, _rx) = spawn_reader(RampSource::new(200, 1_000), 32);
        let signal = reader.signal();
        reader.resume();

        let mut seen = Vec::new();
        wait_until(|| {
            seen.extend(drain(&mut consumer));
            signal.note_queue_read_complete();
            seen.len() == 200
        });
        let expected: Vec<f32> = (0..200).map(RampSource::value_for).collect();
        assert_eq!(seen, expected);
        wait_until(|| reader.reached_end());
    }

    #[test]
    fn stop_then_seek_restarts_from_position() {
        let source = RampSource::new(10_000, 1_000);
        let seeks = source.seeks.clone();
        let resets = source.resets.clone();
        let (reader, mut consumer, _rx) = spawn_reader(source, 64);
        reader.resume();
        wait_until(|| consumer.queue().buffered_len() > 0);

        reader.stop_reading();
        assert_eq!(reader.state(), ReaderState::Waiting);
        // SAFETY: the reader is parked and no read region is alive.
        unsafe { consumer.queue().reset() };
        consumer.discard_grant();
        reader.seek(2.5, Some(10));
        reader.resume();

        wait_until(|| reader.reached_end());
        let samples = drain(&mut consumer);
        let expected: Vec<f32> = (2_500..2_510).map(RampSource::value_for).collect();
        assert_eq!(samples, expected);
        assert_eq!(*seeks.lock().unwrap().last().unwrap(), 2.5);
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn source_failure_is_reported() {
        let mut source = RampSource::new(10_000, 1_000);
        source.fail_at = Some(5);
        source.chunk_frames = 5;
        let (reader, mut consumer, rx) = spawn_reader(source, 64);
        reader.resume();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event.kind, EventKind::Error(_)));
        assert!(reader.reached_end());
        assert_eq!(drain(&mut consumer).len(), 5);
    }

    #[test]
    fn shutdown_joins_waiting_thread() {
        let (mut reader, _consumer, _rx) = spawn_reader(RampSource::new(10, 1_000), 64);
        wait_until(|| reader.state() == ReaderState::Waiting);
        reader.shutdown();
        assert!(reader.is_finished());
        reader.shutdown();
    }
}
