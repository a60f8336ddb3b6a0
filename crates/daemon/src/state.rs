//! Shared recording state: the active-recording counter and the process registry.
//!
//! Both live behind one mutex so that "is there room for one more?" and "take the
//! slot" happen as a single step. A reserved slot is represented by a
//! [`SessionSlot`] guard whose `Drop` gives the slot back, so the counter is
//! released on every exit path of a session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Why a slot could not be reserved
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReserveError {
    #[error("{active} of {max} recordings already running")]
    AtCapacity { active: usize, max: usize },

    #[error("channel is already being recorded")]
    AlreadyRecording,

    #[error("shutdown in progress")]
    ShuttingDown,
}

/// Registry entry for one running recording
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub session_id: Uuid,
    /// OS pid of the recorder, once spawned
    pub pid: Option<u32>,
    pub started_at: Instant,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    active: usize,
    registry: HashMap<String, ProcessEntry>,
    /// Total reservations ever made
    started: u64,
}

/// Process-wide recording bookkeeping shared by the orchestrator, its probe
/// tasks, the recording sessions and the processing pipeline.
#[derive(Debug)]
pub struct RecorderState {
    inner: Mutex<Inner>,
    max_concurrent: usize,
    shutdown: CancellationToken,
    /// Fired whenever a slot is reserved
    session_started: Notify,
    /// Fired whenever the last slot is released
    drained: Notify,
}

impl RecorderState {
    pub fn new(max_concurrent: usize, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            max_concurrent: max_concurrent.max(1),
            shutdown,
            session_started: Notify::new(),
            drained: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded data stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    /// True when no recording is running or starting
    pub fn is_idle(&self) -> bool {
        self.lock().active == 0
    }

    /// Cheap pre-check used before sampling host resources
    pub fn has_room(&self) -> bool {
        self.lock().active < self.max_concurrent
    }

    /// Number of sessions reserved since startup. A change between two reads
    /// means a recording started in between.
    pub fn sessions_started(&self) -> u64 {
        self.lock().started
    }

    pub fn is_registered(&self, channel: &str) -> bool {
        self.lock().registry.contains_key(channel)
    }

    pub fn registered_channels(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().registry.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn entry(&self, channel: &str) -> Option<ProcessEntry> {
        self.lock().registry.get(channel).cloned()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Atomically check capacity and per-channel exclusivity, then take a slot.
    pub fn try_reserve(self: &Arc<Self>, channel: &str) -> Result<SessionSlot, ReserveError> {
        if self.shutdown.is_cancelled() {
            return Err(ReserveError::ShuttingDown);
        }

        let slot = {
            let mut inner = self.lock();
            if inner.registry.contains_key(channel) {
                return Err(ReserveError::AlreadyRecording);
            }
            if inner.active >= self.max_concurrent {
                return Err(ReserveError::AtCapacity {
                    active: inner.active,
                    max: self.max_concurrent,
                });
            }

            let session_id = Uuid::new_v4();
            let cancel = self.shutdown.child_token();
            inner.active += 1;
            inner.started += 1;
            inner.registry.insert(
                channel.to_string(),
                ProcessEntry {
                    session_id,
                    pid: None,
                    started_at: Instant::now(),
                    cancel: cancel.clone(),
                },
            );
            debug!(channel, active = inner.active, "Recording slot reserved");

            SessionSlot {
                state: Arc::clone(self),
                channel: channel.to_string(),
                session_id,
                cancel,
            }
        };

        self.session_started.notify_waiters();
        Ok(slot)
    }

    /// Future resolving the next time a slot is reserved.
    ///
    /// Call `enable()` on the pinned future before checking [`is_idle`](Self::is_idle)
    /// so a reservation in between is not missed.
    pub fn session_started(&self) -> Notified<'_> {
        self.session_started.notified()
    }

    /// Ask every registered session to stop. Returns how many were signalled.
    pub fn terminate_all(&self) -> usize {
        let inner = self.lock();
        for (channel, entry) in &inner.registry {
            debug!(channel = %channel, pid = ?entry.pid, "Cancelling recording session");
            entry.cancel.cancel();
        }
        inner.registry.len()
    }

    /// Wait until no slot is held, or the timeout elapses. Returns true if drained.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_idle() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn release(&self, channel: &str, session_id: Uuid) {
        let now_idle = {
            let mut inner = self.lock();
            match inner.registry.get(channel) {
                Some(entry) if entry.session_id == session_id => {
                    inner.registry.remove(channel);
                }
                _ => warn!(channel, "Registry entry missing on session release"),
            }
            match inner.active.checked_sub(1) {
                Some(active) => inner.active = active,
                None => warn!(channel, "Active recording count already zero on release"),
            }
            debug!(channel, active = inner.active, "Recording slot released");
            inner.active == 0
        };

        if now_idle {
            self.drained.notify_waiters();
        }
    }

    fn set_pid(&self, channel: &str, session_id: Uuid, pid: Option<u32>) {
        let mut inner = self.lock();
        if let Some(entry) = inner.registry.get_mut(channel) {
            if entry.session_id == session_id {
                entry.pid = pid;
            }
        }
    }
}

/// A reserved recording slot. Dropping it deregisters the channel and
/// decrements the active count exactly once.
#[derive(Debug)]
pub struct SessionSlot {
    state: Arc<RecorderState>,
    channel: String,
    session_id: Uuid,
    cancel: CancellationToken,
}

impl SessionSlot {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Cancelled on daemon shutdown or by [`RecorderState::terminate_all`]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record the recorder's pid in the registry
    pub fn set_pid(&self, pid: Option<u32>) {
        self.state.set_pid(&self.channel, self.session_id, pid);
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.state.release(&self.channel, self.session_id);
    }
}
