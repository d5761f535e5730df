//! Download progress stream.
//!
//! Each download attempt is a session. Within a session reported fractions
//! never decrease, and the session ends with exactly one terminal event:
//! either `is_complete` or an `error`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// One progress event of a download session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    /// Session this event belongs to.
    pub session: u64,
    /// Fraction done, in `[0.0, 1.0]`.
    pub fraction: f64,
    pub message: String,
    pub is_complete: bool,
    pub error: Option<String>,
}

impl DownloadProgress {
    /// Whether this is the last event of its session.
    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.error.is_some()
    }
}

/// Fan-out of progress events to any number of subscribers.
///
/// Late subscribers only see events sent after they subscribed.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<DownloadProgress>,
    sessions: Arc<AtomicU64>,
}

impl ProgressBroadcaster {
    /// Create a broadcaster buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sessions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to future progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadProgress> {
        self.tx.subscribe()
    }

    /// Start a new session.
    pub fn begin(&self) -> ProgressSession {
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        ProgressSession {
            tx: self.tx.clone(),
            session,
            state: Mutex::new(SessionState {
                fraction: 0.0,
                finished: false,
            }),
        }
    }
}

struct SessionState {
    fraction: f64,
    finished: bool,
}

/// Emitter for a single download session.
///
/// Dropping a session that has not finished emits a `cancelled` error event.
pub struct ProgressSession {
    tx: broadcast::Sender<DownloadProgress>,
    session: u64,
    state: Mutex<SessionState>,
}

impl ProgressSession {
    /// Session identifier.
    pub fn id(&self) -> u64 {
        self.session
    }

    /// Report intermediate progress.
    ///
    /// `None` or a value lower than the last one repeats the last fraction.
    /// Ignored once the session has finished.
    pub fn report(&self, fraction: Option<f64>, message: impl Into<String>) {
        self.emit(message.into(), |state| {
            if let Some(fraction) = fraction.filter(|f| f.is_finite()) {
                state.fraction = state.fraction.max(fraction.clamp(0.0, 1.0));
            }
            (false, None)
        });
    }

    /// Finish the session successfully.
    pub fn complete(&self, message: impl Into<String>) {
        self.emit(message.into(), |state| {
            state.fraction = 1.0;
            state.finished = true;
            (true, None)
        });
    }

    /// Finish the session with an error.
    pub fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        self.emit("Download failed".to_string(), move |state| {
            state.finished = true;
            (false, Some(error))
        });
    }

    /// Whether a terminal event has been sent.
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit<F>(&self, message: String, update: F)
    where
        F: FnOnce(&mut SessionState) -> (bool, Option<String>),
    {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        let (is_complete, error) = update(&mut state);
        let event = DownloadProgress {
            session: self.session,
            fraction: state.fraction,
            message,
            is_complete,
            error,
        };
        // Sent under the lock so subscribers observe session order.
        let _ = self.tx.send(event);
    }
}

impl Drop for ProgressSession {
    fn drop(&mut self) {
        if !self.is_finished() {
            debug!("Progress session {} dropped before finishing", self.session);
            self.fail("cancelled");
        }
    }
}
