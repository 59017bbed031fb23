//! Filter devices attached to host device stacks

use crate::platform::NativeHandle;
use crate::strategy::{HubStrategy, RedirectorStrategy, Strategy, StrategyKind};
use std::fmt;

/// Our filter on one device node, bound to a single strategy
pub struct FilterDevice {
    instance: u32,
    node: NativeHandle,
    strategy: Strategy,
}

impl FilterDevice {
    pub fn new(instance: u32, node: NativeHandle, strategy: Strategy) -> Self {
        Self {
            instance,
            node,
            strategy,
        }
    }

    /// Driver-wide instance number, reported as the parent ID of children
    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn node(&self) -> NativeHandle {
        self.node
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn serial_number(&self) -> Option<u32> {
        self.strategy.serial_number()
    }

    pub fn as_hub(&self) -> Option<&HubStrategy> {
        match &self.strategy {
            Strategy::Hub(hub) => Some(hub),
            _ => None,
        }
    }

    pub fn as_redirector(&self) -> Option<&RedirectorStrategy> {
        match &self.strategy {
            Strategy::Redirector(redirector) => Some(redirector),
            _ => None,
        }
    }
}

impl fmt::Debug for FilterDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterDevice")
            .field("instance", &self.instance)
            .field("node", &self.node)
            .field("kind", &self.kind())
            .finish()
    }
}
