//! Player controller: owns one queue, its reader thread and its render callback registration.
//!
//! Control methods run on the caller's thread. Anything that repositions or tears down the
//! queue follows the same order:
//! 1. stop sending and wait out any engine mix that may still be rendering this player,
//! 2. stop the reader (or unregister from the engine, or shut down),
//! 3. reset the queue and start a new generation,
//! 4. seek and resume the reader.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};

use crate::bip::SegmentedBipQueue;
use crate::config::PlaybackConfig;
use crate::engine::{AudioEngine, SlotId};
use crate::events::{self, EventDispatcher, EventSender, PlayerObserver};
use crate::format::AudioFormat;
use crate::reader::{ReaderTask, ReaderThread};
use crate::render::RenderCallback;
use crate::session::SessionState;
use crate::source::AudioSource;
use crate::status::{PlayerStatus, StatusSources};

struct Connection {
    format: AudioFormat,
    queue: SegmentedBipQueue,
    reader: ReaderThread,
    /// Held here while not registered with the engine.
    callback: Option<RenderCallback>,
    slot: Option<SlotId>,
}

struct PlayerInner {
    connection: Option<Connection>,
    gain: f32,
    start_position: f64,
    duration: Option<f64>,
}

/// One playable stream mixed into a shared [`AudioEngine`].
pub struct AudioPlayer {
    identifier: Arc<str>,
    engine: Arc<AudioEngine>,
    config: PlaybackConfig,
    session: Arc<SessionState>,
    events: Option<EventSender>,
    dispatcher: EventDispatcher,
    inner: Mutex<PlayerInner>,
}

impl AudioPlayer {
    pub fn new(
        identifier: &str,
        engine: Arc<AudioEngine>,
        config: PlaybackConfig,
        observer: Arc<dyn PlayerObserver>,
    ) -> Result<Self> {
        let identifier: Arc<str> = Arc::from(identifier);
        let session = Arc::new(SessionState::default());
        let (tx, rx) = events::channel(config.event_capacity);
        let dispatcher = EventDispatcher::spawn(identifier.clone(), rx, session.clone(), observer)?;
        Ok(Self {
            identifier,
            engine,
            config,
            session,
            events: Some(tx),
            dispatcher,
            inner: Mutex::new(PlayerInner {
                connection: None,
                gain: 1.0,
                start_position: 0.0,
                duration: None,
            }),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Set up the queue, reader thread and render callback for `source` in `format`.
    ///
    /// `format` must match the engine's sample rate and channel count. Any previous connection
    /// is torn down first. The reader stays idle until [`Self::setup_complete`].
    pub fn connect(&self, format: AudioFormat, source: Box<dyn AudioSource>) -> Result<()> {
        let engine_format = self.engine.input_format();
        if format.sample_rate != engine_format.sample_rate {
            bail!(
                "player format rate {} Hz does not match engine rate {} Hz",
                format.sample_rate,
                engine_format.sample_rate
            );
        }
        if format.channels != engine_format.channels || format.channels == 0 {
            bail!(
                "player format has {} channels, engine expects {}",
                format.channels,
                engine_format.channels
            );
        }
        let Some(events) = self.events.clone() else {
            bail!("player is shutting down");
        };

        let mut inner = self.inner();
        if let Some(old) = inner.connection.take() {
            self.disconnect(old);
        }

        let buffer_seconds = self.config.effective_buffer_seconds();
        let bytes_per_frame = format.bytes_per_frame();
        let read_ahead_frames =
            self.engine.max_output_frames() * self.config.read_ahead_callbacks.max(1);
        // room for two read-ahead chunks plus the slack byte, whatever the buffer length
        let segment_size = (format.frames_for_seconds(buffer_seconds) as usize * bytes_per_frame)
            .max(read_ahead_frames * bytes_per_frame * 2 + 1);
        let (producer, consumer) = SegmentedBipQueue::new(segment_size, format.segment_count());
        let queue = producer.queue();

        self.session.set_sample_rate(format.sample_rate);
        self.session.set_start_position(inner.start_position);
        self.session.should_send.store(false, Ordering::SeqCst);
        self.session.is_sending.store(false, Ordering::Release);
        self.session.advance_generation();

        let reader = ReaderThread::spawn(ReaderTask {
            identifier: self.identifier.clone(),
            producer,
            source,
            format,
            read_ahead_frames,
            session: self.session.clone(),
            events: events.clone(),
        })?;
        let callback = RenderCallback::new(
            self.identifier.clone(),
            consumer,
            format,
            self.session.clone(),
            reader.signal(),
            events,
        );

        tracing::info!(
            player = %self.identifier,
            format = %format,
            buffer_seconds,
            read_ahead_frames,
            queue_bytes = queue.capacity(),
            "player connected"
        );

        if inner.start_position > 0.0 || inner.duration.is_some() {
            reader.seek(
                inner.start_position,
                inner.duration.map(|d| format.frames_for_seconds(d)),
            );
        }

        inner.connection = Some(Connection {
            format,
            queue,
            reader,
            callback: Some(callback),
            slot: None,
        });
        Ok(())
    }

    /// Start reading ahead. Call once after [`Self::connect`].
    pub fn setup_complete(&self) {
        if let Some(conn) = self.inner().connection.as_ref() {
            conn.reader.resume();
        }
    }

    /// Register with the engine (first time only), mark playing and start sending.
    pub fn play(&self) -> Result<()> {
        let mut inner = self.inner();
        let gain = inner.gain;
        let Some(conn) = inner.connection.as_mut() else {
            bail!("player {} is not connected", self.identifier);
        };
        if conn.slot.is_none() {
            let Some(callback) = conn.callback.take() else {
                bail!("player {} lost its render callback", self.identifier);
            };
            match self.engine.add_player(callback, gain) {
                Ok(slot) => conn.slot = Some(slot),
                Err(callback) => {
                    conn.callback = Some(callback);
                    bail!("no free engine slot for player {}", self.identifier);
                }
            }
        }

        self.session.is_playing.store(true, Ordering::Release);
        self.session.should_send.store(true, Ordering::Release);
        self.engine.play();
        tracing::debug!(player = %self.identifier, "play");
        Ok(())
    }

    /// Stop sending; the queue and reader position are kept.
    pub fn pause(&self) {
        self.session.is_playing.store(false, Ordering::Release);
        self.session.should_send.store(false, Ordering::Release);
        tracing::debug!(player = %self.identifier, "pause");
    }

    pub fn is_playing(&self) -> bool {
        self.session.is_playing.load(Ordering::Acquire)
    }

    pub fn gain(&self) -> f32 {
        self.inner().gain
    }

    pub fn set_gain(&self, gain: f32) {
        let mut inner = self.inner();
        inner.gain = gain;
        if let Some(slot) = inner.connection.as_ref().and_then(|c| c.slot) {
            self.engine.set_player_gain(slot, gain);
        }
    }

    /// Current media position in seconds.
    pub fn position(&self) -> f64 {
        self.session
            .position_seconds(self.session.frames_played.load(Ordering::Relaxed))
    }

    /// Mute output ahead of a run of [`Self::seek`] calls (e.g. while scrubbing).
    pub fn start_seek(&self) {
        self.session.should_send.store(false, Ordering::Release);
    }

    /// Move to `seconds`, limiting playback to `duration` seconds when given.
    ///
    /// With `preview`, a short snippet at the new position plays immediately so scrubbing is
    /// audible; call [`Self::finish_seek`] when the user lets go.
    pub fn seek(&self, seconds: f64, duration: Option<f64>, preview: bool) {
        let mut inner = self.inner();
        let seconds = seconds.max(0.0);
        inner.start_position = seconds;
        inner.duration = duration;

        self.stop_sending();
        let Some(conn) = inner.connection.as_mut() else {
            self.session.set_start_position(seconds);
            return;
        };
        let max_frames = duration.map(|d| conn.format.frames_for_seconds(d));
        self.restart_at(conn, seconds, max_frames, false);

        if preview {
            let preview_frames = conn
                .format
                .frames_for_seconds(self.config.effective_preview_seconds());
            conn.reader.seek(seconds, Some(preview_frames));
            conn.reader.resume();
            self.session.should_send.store(true, Ordering::Release);
        }
        tracing::debug!(player = %self.identifier, seconds, preview, "seek");
    }

    /// Rebuffer at the last seek position and resume if playing.
    pub fn finish_seek(&self) {
        let mut inner = self.inner();
        let start = inner.start_position;
        let duration = inner.duration;
        self.stop_sending();
        let Some(conn) = inner.connection.as_mut() else {
            return;
        };
        let max_frames = duration.map(|d| conn.format.frames_for_seconds(d));
        self.restart_at(conn, start, max_frames, true);
        let playing = self.session.is_playing.load(Ordering::Acquire);
        self.session.should_send.store(playing, Ordering::Release);
    }

    /// Stop, unregister from the engine and rewind to the last seek position.
    pub fn reset(&self) {
        let mut inner = self.inner();
        let start = inner.start_position;
        let duration = inner.duration;
        self.session.is_playing.store(false, Ordering::Release);
        self.stop_sending();
        let Some(conn) = inner.connection.as_mut() else {
            return;
        };
        if let Some(slot) = conn.slot.take() {
            conn.callback = self.engine.remove_player(slot);
        }
        let max_frames = duration.map(|d| conn.format.frames_for_seconds(d));
        self.restart_at(conn, start, max_frames, true);
        tracing::debug!(player = %self.identifier, "reset");
    }

    pub fn status(&self) -> PlayerStatus {
        let inner = self.inner();
        let conn = inner.connection.as_ref();
        PlayerStatus::collect(StatusSources {
            identifier: &self.identifier,
            session: &self.session,
            format: conn.map(|c| &c.format),
            queue: conn.map(|c| &c.queue),
            reader_state: conn.map(|c| c.reader.state()),
        })
    }

    /// Stop the reader, empty the queue and start a new generation positioned at `seconds`.
    ///
    /// Callers run [`Self::stop_sending`] first.
    fn restart_at(&self, conn: &mut Connection, seconds: f64, max_frames: Option<u64>, resume: bool) {
        conn.reader.stop_reading();
        // SAFETY: the reader is parked in `Waiting` and holds no write region. `stop_sending`
        // waited out any mix that started while `should_send` was set, and a render that
        // starts later sees it cleared and returns before touching the queue.
        unsafe { conn.queue.reset() };
        self.session.set_start_position(seconds);
        self.session.frames_played.store(0, Ordering::Relaxed);
        self.session.advance_generation();
        conn.reader.seek(seconds, max_frames);
        if resume {
            conn.reader.resume();
        }
    }

    /// Tear down a connection: unregister, stop the reader, free the queue.
    fn disconnect(&self, mut conn: Connection) {
        self.stop_sending();
        if let Some(slot) = conn.slot.take() {
            drop(self.engine.remove_player(slot));
        }
        conn.reader.shutdown();
        drop(conn);
        tracing::debug!(player = %self.identifier, "player disconnected");
    }

    /// Clear `should_send` and wait until no render of this player can still be reading the
    /// queue or mixing a block that points into it.
    fn stop_sending(&self) {
        self.session.should_send.store(false, Ordering::SeqCst);
        self.engine.wait_for_mix();
        self.session.is_sending.store(false, Ordering::Release);
    }

    fn inner(&self) -> MutexGuard<'_, PlayerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        let connection = self.inner().connection.take();
        if let Some(conn) = connection {
            self.disconnect(conn);
        }
        self.session.advance_generation();
        self.events = None;
        self.dispatcher.join();
        tracing::debug!(player = %self.identifier, "player dropped");
    }
}
