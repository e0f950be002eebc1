//! Notifications from the render callback and reader thread back to the control side.
//!
//! The render callback must never block or call user code, so it only `try_send`s small
//! events into a bounded channel. A dispatcher thread drains the channel, drops events from
//! superseded generations, updates shared state and forwards the rest to a
//! [`PlayerObserver`].

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::session::SessionState;

/// Receives player notifications on the dispatcher thread.
///
/// Callbacks must not call back into the [`AudioPlayer`](crate::player::AudioPlayer) that
/// emitted them with methods that wait for the render callback (`seek`, `reset`, drop).
pub trait PlayerObserver: Send + Sync {
    /// Current media position, in seconds from the start of the media.
    fn on_position_updated(&self, _seconds: f64) {}

    /// The source ran out and the queue drained. Playback has stopped.
    fn on_end_of_data(&self) {}

    /// The source failed; playback stops once the queue drains.
    fn on_error(&self, _error: &anyhow::Error) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl PlayerObserver for NullObserver {}

#[derive(Debug)]
pub(crate) enum EventKind {
    Position { frame_index: u64 },
    EndOfData,
    Underrun { required_frames: usize, missing_frames: usize },
    Error(anyhow::Error),
}

#[derive(Debug)]
pub(crate) struct PlayerEvent {
    pub generation: u64,
    pub kind: EventKind,
}

/// Non-blocking sending half, shared by the render callback and the reader thread.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: Sender<PlayerEvent>,
}

impl EventSender {
    /// Queue an event; drops it when the channel is full or the dispatcher is gone.
    pub fn send(&self, generation: u64, kind: EventKind) -> bool {
        match self.tx.try_send(PlayerEvent { generation, kind }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub(crate) fn channel(capacity: usize) -> (EventSender, Receiver<PlayerEvent>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (EventSender { tx }, rx)
}

/// Dispatcher thread handle. Exits once every [`EventSender`] is dropped.
pub(crate) struct EventDispatcher {
    join: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    pub fn spawn(
        identifier: Arc<str>,
        rx: Receiver<PlayerEvent>,
        session: Arc<SessionState>,
        observer: Arc<dyn PlayerObserver>,
    ) -> Result<Self> {
        let join = std::thread::Builder::new()
            .name(format!("{identifier}-events"))
            .spawn(move || dispatch_loop(&identifier, rx, &session, observer.as_ref()))
            .context("spawn player event dispatcher")?;
        Ok(Self { join: Some(join) })
    }

    /// Wait for the dispatcher to drain and exit.
    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!("player event dispatcher panicked");
            }
        }
    }
}

fn dispatch_loop(
    identifier: &str,
    rx: Receiver<PlayerEvent>,
    session: &SessionState,
    observer: &dyn PlayerObserver,
) {
    while let Ok(event) = rx.recv() {
        handle_event(identifier, event, session, observer);
    }
    tracing::debug!(player = identifier, "event dispatcher stopped");
}

pub(crate) fn handle_event(
    identifier: &str,
    event: PlayerEvent,
    session: &SessionState,
    observer: &dyn PlayerObserver,
) {
    if event.generation != session.generation() {
        return;
    }
    match event.kind {
        EventKind::Position { frame_index } => {
            observer.on_position_updated(session.position_seconds(frame_index));
        }
        EventKind::EndOfData => {
            if !session.stop_generation(event.generation) {
                return;
            }
            tracing::info!(player = identifier, "end of data");
            observer.on_end_of_data();
        }
        EventKind::Underrun {
            required_frames,
            missing_frames,
        } => {
            tracing::warn!(
                player = identifier,
                required_frames,
                missing_frames,
                "render callback underrun"
            );
        }
        EventKind::Error(err) => {
            tracing::error!(player = identifier, "audio source failed: {err:#}");
            observer.on_error(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        positions: Mutex<Vec<f64>>,
        ends: Mutex<usize>,
        errors: Mutex<Vec<String>>,
    }

    impl PlayerObserver for Recorder {
        fn on_position_updated(&self, seconds: f64) {
            self.positions.lock().unwrap().push(seconds);
        }
        fn on_end_of_data(&self) {
            *self.ends.lock().unwrap() += 1;
        }
        fn on_error(&self, error: &anyhow::Error) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    fn session() -> SessionState {
        let session = SessionState::default();
        session.set_sample_rate(1_000);
        session.set_start_position(2.0);
        session
    }

    #[test]
    fn stale_generation_is_dropped() {
        let session = session();
        let recorder = Recorder::default();
        session.advance_generation();
        handle_event(
            "t",
            PlayerEvent {
                generation: 0,
                kind: EventKind::Position { frame_index: 500 },
            },
            &session,
            &recorder,
        );
        assert!(recorder.positions.lock().unwrap().is_empty());

        handle_event(
            "t",
            PlayerEvent {
                generation: 1,
                kind: EventKind::Position { frame_index: 500 },
            },
            &session,
            &recorder,
        );
        assert_eq!(*recorder.positions.lock().unwrap(), vec![2.5]);
    }

    #[test]
    fn end_of_data_stops_playback() {
        let session = session();
        session.is_playing.store(true, Ordering::SeqCst);
        session.should_send.store(true, Ordering::SeqCst);
        let recorder = Recorder::default();
        handle_event(
            "t",
            PlayerEvent {
                generation: 0,
                kind: EventKind::EndOfData,
            },
            &session,
            &recorder,
        );
        assert!(!session.is_playing.load(Ordering::SeqCst));
        assert!(!session.should_send.load(Ordering::SeqCst));
        assert_eq!(*recorder.ends.lock().unwrap(), 1);
    }

    #[test]
    fn end_of_data_from_replaced_generation_keeps_sending() {
        let session = session();
        let recorder = Recorder::default();
        let event = PlayerEvent {
            generation: session.generation(),
            kind: EventKind::EndOfData,
        };
        session.advance_generation();
        session.is_playing.store(true, Ordering::SeqCst);
        session.should_send.store(true, Ordering::SeqCst);

        handle_event("t", event, &session, &recorder);
        assert!(session.should_send.load(Ordering::SeqCst));
        assert!(session.is_playing.load(Ordering::SeqCst));
        assert_eq!(*recorder.ends.lock().unwrap(), 0);
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let (tx, rx) = channel(2);
        assert!(tx.send(0, EventKind::EndOfData));
        assert!(tx.send(0, EventKind::EndOfData));
        assert!(!tx.send(0, EventKind::EndOfData));
        drop(rx);
        assert!(!tx.send(0, EventKind::EndOfData));
    }

    #[test]
    fn dispatcher_exits_when_senders_drop() {
        let (tx, rx) = channel(8);
        let recorder = Arc::new(Recorder::default());
        let session = Arc::new(session());
        let mut dispatcher =
            EventDispatcher::spawn(Arc::from("t"), rx, session, recorder.clone()).unwrap();

        tx.send(0, EventKind::Error(anyhow::anyhow!("bad sector")));
        drop(tx);

        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            dispatcher.join();
            done_tx.send(()).unwrap();
        });
        done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("dispatcher did not exit");
        assert_eq!(*recorder.errors.lock().unwrap(), vec!["bad sector".to_string()]);
    }
}
