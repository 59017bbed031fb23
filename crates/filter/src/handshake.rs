//! Redirection handshake
//!
//! `AddRedirect` registers the intent, cycles the device so it
//! re-enumerates under a redirector filter, waits for that filter to come
//! up and finally opens a handle to it inside the requesting process. Any
//! failure rolls the registry entry back before the error is returned.
//! `RemoveRedirect` runs the mirror sequence.
//!
//! Resets and handle opens can block for seconds on real hardware, so they
//! run on the blocking pool instead of the runtime threads.

use crate::control::ControlDevice;
use crate::device::ChildDevice;
use crate::error::{FilterError, Result};
use crate::platform::{DeviceStack, HardwareControl, Platform, PlatformError};
use crate::redirection::{Redirection, RedirectionState};
use crate::rules::RuleStore;
use protocol::{DeviceId, ProcessId, RedirectorHandle};
use tracing::{debug, info, warn};

/// Configuration the raw-mode reset puts a really-raw device into
const RAW_DEVICE_CONFIGURATION: u8 = 1;

impl ControlDevice {
    /// Hand the device `id` over to `requestor`
    pub async fn add_redirect(
        &self,
        id: &DeviceId,
        requestor: ProcessId,
    ) -> Result<RedirectorHandle> {
        let redirection = self.registry().add_redirection(id)?;
        info!("Redirecting {} to process {}", id, requestor);

        if let Err(e) = self.reset_usb_device(id).await {
            warn!("Reset of {} for redirection failed: {}", id, e);
            self.roll_back_redirection(&redirection, false).await;
            return Err(e);
        }

        if let Err(e) = redirection
            .wait_for_attachment(self.handshake.attach_timeout)
            .await
        {
            warn!("Redirector for {} did not come up: {}", id, e);
            self.roll_back_redirection(&redirection, true).await;
            return Err(e);
        }

        match self.create_redirector_handle(&redirection, requestor).await {
            Ok(handle) => {
                info!("Device {} redirected to process {}", id, requestor);
                Ok(handle)
            }
            Err(e) => {
                warn!("Failed to open redirector handle for {}: {}", id, e);
                self.roll_back_redirection(&redirection, true).await;
                Err(e)
            }
        }
    }

    /// Open a user-mode handle to the armed redirector
    ///
    /// The new device object may refuse opens for a short while after it
    /// was created, so opening is retried until the open timeout runs out.
    async fn create_redirector_handle(
        &self,
        redirection: &Redirection,
        requestor: ProcessId,
    ) -> Result<RedirectorHandle> {
        let retries = self.handshake.handle_open_retries();
        let mut last_error = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(self.handshake.handle_retry_interval).await;
            }

            if redirection.is_prepared_for_remove() {
                return Err(FilterError::RemovalInProgress(redirection.id().to_string()));
            }

            let Some(redirector) = redirection.redirector() else {
                continue;
            };

            let node = redirector.node();
            let opened = self
                .run_blocking(move |platform| Ok(platform.open_user_handle(node, requestor)?))
                .await;
            match opened {
                Ok(handle) => {
                    redirection.bind_owner(requestor);
                    debug!(
                        "Redirector handle {:#x} for {} opened after {} attempts",
                        handle.0,
                        redirection.id(),
                        attempt + 1
                    );
                    return Ok(handle);
                }
                Err(e) => last_error = Some(e),
            }
        }

        if let Some(e) = last_error {
            debug!("Last open attempt for {} failed: {}", redirection.id(), e);
        }
        Err(FilterError::Timeout("redirector handle"))
    }

    /// Withdraw a redirection whose setup failed
    ///
    /// The registry entry goes first; a failing compensating reset is only
    /// logged.
    async fn roll_back_redirection(&self, redirection: &Redirection, reset: bool) {
        redirection.set_state(RedirectionState::RolledBack);
        if let Err(e) = self.registry().remove_redirection(redirection.id()) {
            warn!("Rollback of {}: {}", redirection.id(), e);
        }

        if reset {
            if let Err(e) = self.reset_usb_device(redirection.id()).await {
                warn!("Compensating reset of {} failed: {}", redirection.id(), e);
            }
        }
        info!("Redirection of {} rolled back", redirection.id());
    }

    /// Make the device re-enumerate
    pub async fn reset_usb_device(&self, id: &DeviceId) -> Result<()> {
        let child = self
            .registry()
            .find_child(id)
            .ok_or(FilterError::Platform(PlatformError::NoSuchDevice))?;
        let rules = self.rules.clone();
        self.run_blocking(move |platform| reset_child(platform, &rules, &child))
            .await
    }

    /// Run a collaborator call that may block on the blocking pool
    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Platform) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let platform = self.platform().clone();
        tokio::task::spawn_blocking(move || f(&*platform))
            .await
            .map_err(|e| FilterError::Platform(PlatformError::Failed(e.to_string())))?
    }

    /// Tear down the redirection of `id` owned by `pid`
    ///
    /// `ProcessId::ANY` removes it regardless of the owner. On timeout the
    /// entry stays registered so the call can be repeated.
    pub async fn remove_redirect(&self, id: &DeviceId, pid: ProcessId) -> Result<()> {
        self.registry()
            .modify_redirection(id, Some(pid), Redirection::notify_removal_started)?;

        match self.reset_usb_device(id).await {
            Ok(()) => {
                if let Some(redirection) = self.registry().find_redirection(id) {
                    redirection
                        .wait_for_detachment(self.handshake.detach_timeout)
                        .await?;
                }
            }
            Err(FilterError::Platform(PlatformError::NoSuchDevice)) => {
                debug!("{} already gone, not waiting for detachment", id);
            }
            Err(e) => return Err(e),
        }

        match self.registry().remove_redirection(id) {
            Ok(redirection) => {
                redirection.set_state(RedirectionState::Removed);
                info!("Redirection of {} removed", id);
            }
            Err(e) => warn!("Redirection of {} vanished during removal: {}", id, e),
        }
        Ok(())
    }
}

/// Cycle the port of `child`
///
/// A really-raw device that left configuration 1 is put back into it and
/// reset first so it comes back in a state its stack expects.
fn reset_child(platform: &dyn Platform, rules: &RuleStore, child: &ChildDevice) -> Result<()> {
    let node = child.node();

    if child.if_really_raw(rules) && child.raw_configuration() != RAW_DEVICE_CONFIGURATION {
        match platform.set_configuration(node, RAW_DEVICE_CONFIGURATION) {
            Ok(()) => child.set_raw_configuration(RAW_DEVICE_CONFIGURATION),
            Err(e) => warn!("Failed to select configuration 1 on {}: {}", child.id(), e),
        }
        if let Err(e) = platform.reset(node) {
            warn!("Failed to reset raw device {}: {}", child.id(), e);
        }
    }

    debug!("Cycling port of {}", child.id());
    platform.cycle(node)?;
    Ok(())
}
