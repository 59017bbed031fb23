//! Pending and active redirections
//!
//! A [`Redirection`] tracks the hand-off of one device to a user-mode
//! owner. It is shared (`Arc`) between the registry and whichever
//! handshake step currently works on it, and carries two binary events the
//! handshake waits on: "redirector created" and "redirector removed".

use crate::error::{FilterError, Result};
use crate::filter_device::FilterDevice;
use parking_lot::Mutex;
use protocol::{DeviceId, ProcessId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Handshake progress of a redirection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectionState {
    /// Registered, waiting for the device to re-enumerate
    Pending,
    /// Redirector device object exists
    Armed,
    /// A user-mode handle was handed out
    Attached,
    RemovalStarted,
    Removed,
    /// Setup failed and the entry was withdrawn
    RolledBack,
}

struct Inner {
    state: RedirectionState,
    owner: ProcessId,
    redirector: Option<Arc<FilterDevice>>,
}

pub struct Redirection {
    id: DeviceId,
    inner: Mutex<Inner>,
    removal_in_progress: AtomicBool,
    created: watch::Sender<bool>,
    removed: watch::Sender<bool>,
}

impl Redirection {
    pub(crate) fn new(id: DeviceId) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner {
                state: RedirectionState::Pending,
                owner: ProcessId::ANY,
                redirector: None,
            }),
            removal_in_progress: AtomicBool::new(false),
            created: watch::Sender::new(false),
            removed: watch::Sender::new(false),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn state(&self) -> RedirectionState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: RedirectionState) {
        self.inner.lock().state = state;
    }

    /// Process that received the redirector handle, `ANY` until attached
    pub fn owner(&self) -> ProcessId {
        self.inner.lock().owner
    }

    /// `ANY` matches every owner
    pub fn matches_process(&self, pid: ProcessId) -> bool {
        pid.is_any() || self.inner.lock().owner == pid
    }

    pub fn is_prepared_for_remove(&self) -> bool {
        self.removal_in_progress.load(Ordering::Acquire)
    }

    pub fn redirector(&self) -> Option<Arc<FilterDevice>> {
        self.inner.lock().redirector.clone()
    }

    /// The redirector device object for this redirection came up
    pub(crate) fn notify_redirector_created(&self, redirector: Arc<FilterDevice>) {
        {
            let mut inner = self.inner.lock();
            inner.redirector = Some(redirector);
            inner.state = RedirectionState::Armed;
        }
        self.created.send_replace(true);
        debug!("Redirector for {} created", self.id);
    }

    /// Start tearing the redirection down and drop the redirector reference
    pub(crate) fn notify_removal_started(&self) {
        self.removal_in_progress.store(true, Ordering::Release);
        let redirector = {
            let mut inner = self.inner.lock();
            inner.state = RedirectionState::RemovalStarted;
            inner.redirector.take()
        };
        drop(redirector);
        // Wakes attachment waiters so they notice the removal
        self.created.send_replace(false);
        info!("Removal of redirection {} started", self.id);
    }

    /// The redirected device went away; honoured only during removal
    pub(crate) fn notify_redirection_removed(&self) {
        if self.is_prepared_for_remove() {
            self.removed.send_replace(true);
            debug!("Redirector for {} removed", self.id);
        }
    }

    pub(crate) fn bind_owner(&self, owner: ProcessId) {
        let mut inner = self.inner.lock();
        inner.owner = owner;
        inner.state = RedirectionState::Attached;
    }

    /// Wait until the redirector device object exists
    ///
    /// Returns early with [`FilterError::RemovalInProgress`] if removal
    /// starts while waiting.
    pub async fn wait_for_attachment(&self, timeout: Duration) -> Result<()> {
        let mut created = self.created.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            created.wait_for(|created| *created || self.is_prepared_for_remove()),
        )
        .await
        .map(|signalled| signalled.is_ok());

        match waited {
            Err(_) => Err(FilterError::Timeout("redirector attachment")),
            Ok(_) if self.is_prepared_for_remove() => {
                Err(FilterError::RemovalInProgress(self.id.to_string()))
            }
            Ok(true) => Ok(()),
            Ok(false) => Err(FilterError::InvalidState(self.id.to_string())),
        }
    }

    /// Wait until the redirected device confirmed its teardown
    pub async fn wait_for_detachment(&self, timeout: Duration) -> Result<()> {
        let mut removed = self.removed.subscribe();
        let waited = tokio::time::timeout(timeout, removed.wait_for(|removed| *removed))
            .await
            .map(|signalled| signalled.is_ok());

        match waited {
            Err(_) => Err(FilterError::Timeout("redirector detachment")),
            Ok(true) => Ok(()),
            Ok(false) => Err(FilterError::InvalidState(self.id.to_string())),
        }
    }
}

impl std::fmt::Debug for Redirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redirection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("removal_in_progress", &self.is_prepared_for_remove())
            .finish()
    }
}
