//! Deferred child teardown
//!
//! Children leave their hub's list under the hub lock ("detach") and are
//! finalized later on a dedicated OS thread ("finalize"): confirmed raw
//! devices are flagged for driver reinstall, the registry is told their
//! redirection is gone, and the last reference is dropped there.
//!
//! Finalizing reads and writes the durable store, so it never runs on a
//! runtime thread. The queue itself is an async channel, which lets async
//! callers flush it without blocking.

use crate::device::{ChildDevice, DeviceRegistry};
use crate::rules::RuleStore;
use async_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Commands for the teardown worker
#[derive(Debug)]
pub enum TeardownCommand {
    /// Finalize children already detached from their hub
    Finalize(Vec<Arc<ChildDevice>>),
    /// Reply once every earlier command was processed
    Flush(oneshot::Sender<()>),
}

/// Finalize one detached child
pub fn finalize_child(registry: &DeviceRegistry, rules: &RuleStore, child: Arc<ChildDevice>) {
    if child.if_really_raw(rules) {
        child.mark_raw_device_to_reinstall(rules);
    }
    registry.notify_redirection_removed(child.id());
    debug!("Child {} finalized", child.id());
}

/// Sending side of the teardown worker
#[derive(Debug, Clone)]
pub struct TeardownQueue {
    tx: Sender<TeardownCommand>,
}

impl TeardownQueue {
    /// A queue without a worker; everything scheduled is handed back
    pub fn closed() -> Self {
        let (tx, _rx) = unbounded();
        tx.close();
        Self { tx }
    }

    /// Queue children for finalization
    ///
    /// Hands them back if the worker is gone.
    pub fn schedule(&self, children: Vec<Arc<ChildDevice>>) -> Result<(), Vec<Arc<ChildDevice>>> {
        if let Err(e) = self.tx.try_send(TeardownCommand::Finalize(children)) {
            if let TeardownCommand::Finalize(children) = e.into_inner() {
                return Err(children);
            }
        }
        Ok(())
    }

    /// Wait until everything queued so far was finalized
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(TeardownCommand::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Stop accepting work; the worker drains what is queued and exits
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Worker thread finalizing detached children
pub struct TeardownWorker {
    rx: Receiver<TeardownCommand>,
    registry: Arc<DeviceRegistry>,
    rules: Arc<RuleStore>,
}

impl TeardownWorker {
    pub fn new(
        rx: Receiver<TeardownCommand>,
        registry: Arc<DeviceRegistry>,
        rules: Arc<RuleStore>,
    ) -> Self {
        Self {
            rx,
            registry,
            rules,
        }
    }

    /// Process commands until the queue is closed and drained
    pub fn run(self) {
        info!("Teardown worker started");

        while let Ok(cmd) = self.rx.recv_blocking() {
            self.handle_command(cmd);
        }

        info!("Teardown worker stopped");
    }

    fn handle_command(&self, cmd: TeardownCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in teardown handler: {:?}", e);
        }
    }

    fn handle_command_inner(&self, cmd: TeardownCommand) {
        match cmd {
            TeardownCommand::Finalize(children) => {
                debug!("Finalizing {} children", children.len());
                for child in children {
                    finalize_child(&self.registry, &self.rules, child);
                }
            }
            TeardownCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Start the teardown worker on its own OS thread
pub fn spawn_teardown_worker(
    registry: Arc<DeviceRegistry>,
    rules: Arc<RuleStore>,
) -> std::io::Result<(TeardownQueue, JoinHandle<()>)> {
    let (tx, rx) = unbounded();
    let worker = TeardownWorker::new(rx, registry, rules);
    let handle = std::thread::Builder::new()
        .name("teardown-worker".to_string())
        .spawn(move || worker.run())?;
    Ok((TeardownQueue { tx }, handle))
}

/// Finalize children on the caller when the worker is gone
pub(crate) fn finalize_inline(
    registry: &DeviceRegistry,
    rules: &RuleStore,
    children: Vec<Arc<ChildDevice>>,
) {
    warn!("Teardown worker unavailable, finalizing {} children inline", children.len());
    for child in children {
        finalize_child(registry, rules, child);
    }
}
