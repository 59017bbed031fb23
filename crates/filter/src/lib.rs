//! USB device interception core
//!
//! Sits in the device stack of every USB hub, tracks the children each hub
//! enumerates and decides per device whether to leave it alone, hide it
//! from the OS, keep it in driverless raw mode, or hand it over to a
//! user-mode process (redirection).
//!
//! The host drives a [`ControlDevice`] with device-framework callbacks
//! (`add_device`, `remove_device`, `bus_relations_changed`, `on_pnp`,
//! file events) and with [`protocol::ControlRequest`]s from user mode.
//! Hardware access, device-stack attachment and durable rule storage are
//! collaborators behind the traits in [`platform`] and [`store`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use filter::{ControlDevice, DriverConfig, MemoryStore};
//! # async fn run(platform: Arc<dyn filter::Platform>) -> anyhow::Result<()> {
//! let config = DriverConfig::load_or_default();
//! let store = config.open_store()?;
//! let control = ControlDevice::start(&config, platform, store);
//!
//! let count = control.dispatch(protocol::ControlRequest::CountDevices).await?;
//! println!("{:?}", count);
//! control.shutdown().await;
//! # let _ = MemoryStore::new();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod filter_device;
mod handshake;
pub mod platform;
pub mod redirection;
pub mod rules;
pub mod store;
pub mod strategy;
pub mod teardown;
pub mod usb;

pub use config::{DriverConfig, load_config};
pub use control::ControlDevice;
pub use device::{ChildDevice, DeviceRegistry};
pub use error::{FilterError, Result};
pub use filter_device::FilterDevice;
pub use platform::{
    BusProbe, DeviceStack, HardwareControl, NativeHandle, Platform, PlatformError, PlatformResult,
};
pub use redirection::{Redirection, RedirectionState};
pub use rules::RuleStore;
pub use store::{MemoryStore, RegValue, RegistryStore, StorageError};
pub use strategy::{DeviceCapabilities, IdKind, PnpRequest, StrategyKind, TextKind};
pub use usb::RusbPlatform;
