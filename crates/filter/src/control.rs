//! The process-wide control device
//!
//! [`ControlDevice`] owns the rule store, the device registry and the
//! teardown worker, and is the single entry point for both the host's
//! device-framework callbacks (add/remove device, bus relations, PnP and
//! file events) and the user-mode control requests.

use crate::config::{DriverConfig, HandshakeSettings};
use crate::device::{ChildDevice, DeviceRegistry};
use crate::error::{FilterError, Result};
use crate::filter_device::FilterDevice;
use crate::platform::{BusProbe, NativeHandle, Platform};
use crate::rules::hide::RuleLifetime;
use crate::rules::RuleStore;
use crate::store::RegistryStore;
use crate::strategy::{
    self, HiderStrategy, HubStrategy, PnpRequest, RawFilterStrategy, RedirectorStrategy, Strategy,
    StrategyKind,
};
use crate::teardown::{self, TeardownQueue};
use parking_lot::Mutex;
use protocol::{
    ConfigDescriptorRequest, ControlError, ControlRequest, ControlResponse, DeviceId, DeviceInfo,
    HideRuleRequest, ProcessId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct ControlDevice {
    pub(crate) handshake: HandshakeSettings,
    platform: Arc<dyn Platform>,
    pub(crate) rules: Arc<RuleStore>,
    registry: Arc<DeviceRegistry>,
    /// Filter devices by the node they are attached to
    filters: Mutex<HashMap<NativeHandle, Arc<FilterDevice>>>,
    next_instance: AtomicU32,
    teardown: TeardownQueue,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ControlDevice {
    /// Build the context, start the teardown worker and load the
    /// persistent hide rules
    ///
    /// Without a worker thread detached children are finalized inline.
    pub fn start(
        config: &DriverConfig,
        platform: Arc<dyn Platform>,
        store: Arc<dyn RegistryStore>,
    ) -> Arc<Self> {
        let rules = Arc::new(RuleStore::new(store, config.rule_keys()));
        let registry = Arc::new(DeviceRegistry::new());
        let (teardown, worker) =
            match teardown::spawn_teardown_worker(registry.clone(), rules.clone()) {
                Ok((queue, handle)) => (queue, Some(handle)),
                Err(e) => {
                    error!("Failed to spawn teardown worker: {}", e);
                    (TeardownQueue::closed(), None)
                }
            };

        match rules.reload_persistent_rules() {
            Ok(count) => info!("Loaded {} persistent hide rules", count),
            Err(e) => warn!("Failed to load persistent hide rules: {}", e),
        }

        info!("Control device started");
        Arc::new(Self {
            handshake: config.handshake.clone(),
            platform,
            rules,
            registry,
            filters: Mutex::new(HashMap::new()),
            next_instance: AtomicU32::new(0),
            teardown,
            worker: Mutex::new(worker),
        })
    }

    /// Stop the teardown worker after it drained its queue
    pub async fn shutdown(&self) {
        self.teardown.close();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Teardown worker ended abnormally: {:?}", e),
                Err(e) => warn!("Failed to join teardown worker: {}", e),
            }
        }
        info!("Control device stopped");
    }

    /// Wait until every child detached so far was finalized
    pub async fn flush_teardown(&self) {
        self.teardown.flush().await;
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub(crate) fn schedule_teardown(&self, children: Vec<Arc<ChildDevice>>) {
        if let Err(children) = self.teardown.schedule(children) {
            teardown::finalize_inline(&self.registry, &self.rules, children);
        }
    }

    pub fn filter(&self, node: NativeHandle) -> Option<Arc<FilterDevice>> {
        self.filters.lock().get(&node).cloned()
    }

    pub fn filter_count(&self) -> usize {
        self.filters.lock().len()
    }

    // Device framework callbacks

    /// The host offers us a place in `node`'s device stack
    ///
    /// Returns `None` when filtering is declined.
    pub fn add_device(&self, node: NativeHandle) -> Option<Arc<FilterDevice>> {
        if let Some(existing) = self.filter(node) {
            debug!("{} already filtered", node);
            return Some(existing);
        }

        let kind = strategy::select(self, node);
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let strategy = match kind {
            StrategyKind::Null => {
                debug!("Not filtering {}", node);
                return None;
            }
            StrategyKind::Hub => Strategy::Hub(HubStrategy::new()),
            StrategyKind::Redirector => {
                let id = match self.identity(node) {
                    Some(id) => id,
                    None => return None,
                };
                Strategy::Redirector(RedirectorStrategy::new(id))
            }
            StrategyKind::Hider => {
                Strategy::Hider(HiderStrategy::new(self.registry.register_hidden_device(instance)))
            }
            StrategyKind::RawFilter => Strategy::RawFilter(RawFilterStrategy::new(
                self.registry.register_hidden_device(instance),
            )),
        };

        let filter = Arc::new(FilterDevice::new(instance, node, strategy));
        {
            let mut filters = self.filters.lock();
            if let Some(existing) = filters.get(&node) {
                let existing = existing.clone();
                drop(filters);
                debug!("{} was filtered concurrently, dropping filter {}", node, instance);
                self.discard_filter(&filter);
                return Some(existing);
            }
            filters.insert(node, filter.clone());
        }

        match filter.strategy() {
            Strategy::Hub(_) => self.registry.register_filter(filter.clone()),
            Strategy::Redirector(redirector) => {
                if !self
                    .registry
                    .notify_redirector_attached(redirector.id(), filter.clone())
                {
                    warn!("Redirection for {} vanished before its redirector came up", redirector.id());
                }
            }
            _ => {}
        }

        info!("Filter {} attached to {} as {:?}", instance, node, kind);
        Some(filter)
    }

    /// Release what a filter that lost the attach race acquired
    fn discard_filter(&self, filter: &FilterDevice) {
        if let Strategy::Hider(_) | Strategy::RawFilter(_) = filter.strategy() {
            self.registry.unregister_hidden_device(filter.instance());
        }
    }

    fn identity(&self, node: NativeHandle) -> Option<DeviceId> {
        let device_id = self.platform.device_id(node);
        let instance_id = self.platform.instance_id(node);
        match (device_id, instance_id) {
            (Ok(device_id), Ok(instance_id)) => Some(DeviceId::new(device_id, instance_id)),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Cannot query identity of {}: {}", node, e);
                None
            }
        }
    }

    /// The node our filter sits on was removed
    pub fn remove_device(&self, node: NativeHandle) {
        let Some(filter) = self.filters.lock().remove(&node) else {
            debug!("Removal of unfiltered {}", node);
            return;
        };
        info!("Filter {} on {} removed", filter.instance(), node);
        filter.strategy().on_removal(self, &filter);
    }

    /// A hub reported its current children
    pub fn bus_relations_changed(&self, node: NativeHandle, relations: &[NativeHandle]) {
        let Some(filter) = self.filter(node) else {
            debug!("Bus relations for unfiltered {}", node);
            return;
        };
        match filter.as_hub() {
            Some(hub) => hub.on_bus_relations(self, filter.instance(), relations),
            None => debug!("Ignoring bus relations of non-hub filter {}", filter.instance()),
        }
    }

    /// Let the bound strategy patch a completed PnP query
    pub fn on_pnp(&self, node: NativeHandle, request: &mut PnpRequest) {
        if let Some(filter) = self.filter(node) {
            filter.strategy().on_pnp(self, node, request);
        }
    }

    /// A handle to the redirector on `node` was opened
    pub fn on_file_create(&self, node: NativeHandle) {
        if let Some(redirector) = self.filter(node).as_deref().and_then(FilterDevice::as_redirector)
        {
            redirector.on_file_create();
        }
    }

    /// A handle to the redirector on `node` was closed by `pid`
    ///
    /// Drives the redirection removal on behalf of the closer while other
    /// handles stay open, and for any owner after the last close.
    pub async fn on_file_close(&self, node: NativeHandle, pid: ProcessId) -> Result<()> {
        let Some(filter) = self.filter(node) else {
            return Ok(());
        };
        let Some(redirector) = filter.as_redirector() else {
            return Ok(());
        };
        let owner = redirector.on_file_close(pid);
        let id = redirector.id().clone();
        debug!("Redirector handle for {} closed by {}, removing for {}", id, pid, owner);
        self.remove_redirect(&id, owner).await
    }

    // Control requests

    pub fn count_devices(&self) -> usize {
        self.registry.count_devices()
    }

    pub fn enumerate_devices(&self, capacity: usize) -> Result<Vec<DeviceInfo>> {
        self.registry.enumerate(capacity)
    }

    pub fn get_configuration_descriptor(&self, request: &ConfigDescriptorRequest) -> Result<Vec<u8>> {
        let child = self
            .registry
            .find_child(&request.id)
            .ok_or_else(|| FilterError::NotFound(request.id.to_string()))?;
        child
            .configuration_descriptor(request.index)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                FilterError::InvalidRequest(format!(
                    "{} has no configuration {}",
                    request.id, request.index
                ))
            })
    }

    pub fn add_hide_rule(&self, request: &HideRuleRequest) -> Result<()> {
        self.rules.add_rule(request, RuleLifetime::Dynamic)
    }

    pub fn add_persistent_hide_rule(&self, request: &HideRuleRequest) -> Result<()> {
        self.rules.add_rule(request, RuleLifetime::Persistent)
    }

    pub fn clear_hide_rules(&self) {
        self.rules.clear_rules();
    }

    /// Drop dynamic rules and reload the persistent ones
    pub fn reload_registry_parameters(&self) -> Result<usize> {
        self.rules.rescan()
    }

    /// Execute one user-mode request
    pub async fn dispatch(&self, request: ControlRequest) -> protocol::Result<ControlResponse> {
        let name = request.name();
        debug!("Control request {}", name);

        let result = match request {
            ControlRequest::CountDevices => Ok(ControlResponse::Count(self.count_devices())),
            ControlRequest::EnumerateDevices { capacity } => self
                .enumerate_devices(capacity)
                .map(ControlResponse::Devices),
            ControlRequest::GetConfigurationDescriptor(request) => self
                .get_configuration_descriptor(&request)
                .map(ControlResponse::ConfigurationDescriptor),
            ControlRequest::AddRedirect { id, requestor } => self
                .add_redirect(&id, requestor)
                .await
                .map(ControlResponse::Redirected),
            ControlRequest::RemoveRedirect { id, pid } => self
                .remove_redirect(&id, pid)
                .await
                .map(|()| ControlResponse::Done),
            ControlRequest::AddHideRule(rule) => {
                self.add_hide_rule(&rule).map(|()| ControlResponse::Done)
            }
            ControlRequest::AddPersistentHideRule(rule) => self
                .add_persistent_hide_rule(&rule)
                .map(|()| ControlResponse::Done),
            ControlRequest::ClearHideRules => {
                self.clear_hide_rules();
                Ok(ControlResponse::Done)
            }
            ControlRequest::ReloadRegistryParameters => self
                .reload_registry_parameters()
                .map(|_| ControlResponse::Done),
        };

        result.map_err(|e| {
            warn!("{} failed: {}", name, e);
            ControlError::from(e)
        })
    }
}
