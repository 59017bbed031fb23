//! Hub strategy: tracks the children a hub reports on its bus relations

use crate::control::ControlDevice;
use crate::device::{ChildDevice, ProbedIdentity};
use crate::platform::{BusProbe, DeviceStack, NativeHandle, Platform, PlatformResult};
use common::ids::is_usb_device_id;
use parking_lot::Mutex;
use protocol::DeviceId;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Split a relation update into `(removed, added)`
///
/// `removed = known - current` and `added = current - known`, each in the
/// order of its source list.
pub fn diff_relations(
    known: &[NativeHandle],
    current: &[NativeHandle],
) -> (Vec<NativeHandle>, Vec<NativeHandle>) {
    let removed = known
        .iter()
        .filter(|node| !current.contains(node))
        .copied()
        .collect();
    let mut added: Vec<NativeHandle> = Vec::new();
    for node in current {
        if !known.contains(node) && !added.contains(node) {
            added.push(*node);
        }
    }
    (removed, added)
}

#[derive(Debug, Default)]
pub struct HubStrategy {
    children: Mutex<Vec<Arc<ChildDevice>>>,
}

impl HubStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Snapshot of the current children
    pub fn children(&self) -> Vec<Arc<ChildDevice>> {
        self.children.lock().clone()
    }

    pub(crate) fn with_children<R>(&self, f: impl FnOnce(&[Arc<ChildDevice>]) -> R) -> R {
        f(&self.children.lock())
    }

    pub(crate) fn find(&self, id: &DeviceId) -> Option<Arc<ChildDevice>> {
        self.children
            .lock()
            .iter()
            .find(|child| child.matches(id))
            .cloned()
    }

    pub(crate) fn find_by_node(&self, node: NativeHandle) -> Option<Arc<ChildDevice>> {
        self.children
            .lock()
            .iter()
            .find(|child| child.node() == node)
            .cloned()
    }

    /// Append a child unless one already exists for its node
    pub(crate) fn insert_child(&self, child: Arc<ChildDevice>) -> bool {
        let mut children = self.children.lock();
        if children.iter().any(|known| known.node() == child.node()) {
            return false;
        }
        children.push(child);
        true
    }

    /// Move every child out of the list
    pub(crate) fn detach_all(&self) -> Vec<Arc<ChildDevice>> {
        std::mem::take(&mut *self.children.lock())
    }

    /// Reconcile the child list with the hub's current bus relations
    ///
    /// Vanished children are detached under the lock and handed to the
    /// teardown worker. New relations are probed and classified outside
    /// the lock.
    pub(crate) fn on_bus_relations(
        &self,
        ctx: &ControlDevice,
        hub_instance: u32,
        relations: &[NativeHandle],
    ) {
        let (removed, added) = {
            let mut children = self.children.lock();
            let known: Vec<NativeHandle> = children.iter().map(|child| child.node()).collect();
            let (gone, added) = diff_relations(&known, relations);

            let mut removed = Vec::with_capacity(gone.len());
            children.retain(|child| {
                if gone.contains(&child.node()) {
                    removed.push(child.clone());
                    false
                } else {
                    true
                }
            });
            (removed, added)
        };

        if !removed.is_empty() {
            debug!(
                "Hub {}: {} children gone, {} new relations",
                hub_instance,
                removed.len(),
                added.len()
            );
            ctx.schedule_teardown(removed);
        }

        for node in added {
            let identity = match probe_child(ctx.platform().as_ref(), node) {
                Ok(Some(identity)) => identity,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping relation {} of hub {}: {}", node, hub_instance, e);
                    continue;
                }
            };

            let child = Arc::new(ChildDevice::new(hub_instance, identity));
            if !self.insert_child(child.clone()) {
                continue;
            }
            info!("Hub {}: new child {} on port {}", hub_instance, child.id(), child.port());

            apply_redirection_policy(ctx, &child);
        }
    }
}

/// Read the identity of a new bus relation
///
/// `Ok(None)` for relations that are not USB devices.
fn probe_child(platform: &dyn Platform, node: NativeHandle) -> PlatformResult<Option<ProbedIdentity>> {
    let device_id = platform.device_id(node)?;
    if !is_usb_device_id(&device_id) {
        debug!("Relation {} is not a USB device ({})", node, device_id);
        return Ok(None);
    }

    let instance_id = platform.instance_id(node)?;
    let location_id = platform.location_id(node)?;
    let port = platform.port(node)?;
    let speed = platform.speed(node)?;
    let descriptor = platform.device_descriptor(node)?;
    let config_descriptors = (0..descriptor.num_configurations)
        .map(|index| platform.configuration_descriptor(node, index))
        .collect::<PlatformResult<Vec<_>>>()?;

    Ok(Some(ProbedIdentity {
        id: DeviceId::new(device_id, instance_id),
        location_id,
        node,
        port,
        speed,
        descriptor,
        config_descriptors,
    }))
}

/// Attach our filter to a new child if anything wants to intercept it
fn apply_redirection_policy(ctx: &ControlDevice, child: &ChildDevice) {
    let wanted = ctx.registry().should_redirect(child.id())
        || ctx.rules().should_hide(child.descriptor(), child.classes())
        || ctx
            .rules()
            .should_raw_filter(child.device_id(), child.location_id(), false)
            .raw_filter;

    if !wanted {
        debug!("Not attaching to {}", child.id());
        return;
    }

    match ctx.platform().attach_to_device_stack(child.node()) {
        Ok(()) => info!("Attached to device stack of {}", child.id()),
        Err(e) => warn!("Failed to attach to device stack of {}: {}", child.id(), e),
    }
}
