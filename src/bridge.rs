//! The bridge: guarded private operations on a host-owned configuration.
//!
//! ## Lifecycle
//!
//! Every attachment point moves `Unattached` → `Attached` through the
//! bridge, then `Consumed` when the host instantiates the configuration.
//! Consumption is driven by the framework and is irreversible; every
//! apply operation on a consumed configuration fails with
//! [`Error::PreconditionViolated`] and changes nothing.
//!
//! ## Order of checks
//!
//! Each apply operation checks, in order: lifecycle, capability, argument.
//! Only after all three pass is a private message sent, so a failed call
//! never leaves a partial change behind.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capability::{CapabilityCache, CapabilityTable};
use crate::debug_stub::DebugStubDescriptor;
use crate::feature::Feature;
use crate::firmware::FirmwareImageLocation;
use crate::framework::{AttachmentState, Framework, SerialTransportKind};
use crate::{Error, Result};

/// What to do when a debug stub is attached to a configuration that already has one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReattachPolicy {
    /// Install the new stub; the previous one is discarded.
    #[default]
    Replace,
    /// Fail with [`Error::AlreadyAttached`].
    Reject,
}

/// Adapter exposing private framework capabilities over a [`Framework`].
///
/// Holds the framework handle and its capability table only; configurations
/// are borrowed per call and never retained.
#[derive(Debug)]
pub struct Bridge<'f, F: Framework> {
    framework: &'f F,
    capabilities: CapabilityTable,
    reattach: ReattachPolicy,
}

impl<'f, F: Framework> Bridge<'f, F> {
    /// Probe the framework and build a bridge over it.
    pub fn new(framework: &'f F) -> Self {
        Self::with_capabilities(framework, CapabilityTable::resolve(framework))
    }

    /// Build a bridge using a memoized capability table.
    pub fn cached(framework: &'f F, cache: &CapabilityCache) -> Self {
        Self::with_capabilities(framework, cache.resolve(framework))
    }

    /// Build a bridge from an already-resolved table.
    pub fn with_capabilities(framework: &'f F, capabilities: CapabilityTable) -> Self {
        Self {
            framework,
            capabilities,
            reattach: ReattachPolicy::default(),
        }
    }

    /// Set the debug stub reattach policy.
    pub fn reattach_policy(mut self, policy: ReattachPolicy) -> Self {
        self.reattach = policy;
        self
    }

    pub fn framework(&self) -> &'f F {
        self.framework
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Whether `feature` can be applied on this framework version.
    ///
    /// Reads the capability table only; never sends a message.
    pub fn is_feature_supported(&self, feature: Feature) -> bool {
        self.capabilities.is_supported(feature)
    }

    fn require(&self, feature: Feature) -> Result<()> {
        let availability = self.capabilities.availability(feature);
        match availability.reason() {
            None => Ok(()),
            Some(reason) => Err(Error::unsupported(
                feature,
                format!("{} on framework {}", reason, self.capabilities.version()),
            )),
        }
    }

    fn ensure_unconsumed(&self, config: &F::Configuration, operation: &str) -> Result<()> {
        if self.framework.is_consumed(config) {
            return Err(Error::PreconditionViolated(format!(
                "cannot {}: configuration was already handed to instantiation",
                operation
            )));
        }
        Ok(())
    }

    /// Point the boot loader at a custom firmware image.
    ///
    /// The loader is mutated in place.
    pub fn set_firmware_image_location(
        &self,
        loader: &mut F::BootLoader,
        location: &FirmwareImageLocation,
    ) -> Result<()> {
        if self.framework.is_boot_loader_consumed(loader) {
            return Err(Error::PreconditionViolated(
                "cannot set firmware image: boot loader was already handed to instantiation"
                    .into(),
            ));
        }
        self.require(Feature::BootRomOverride)?;
        location.ensure_readable()?;

        self.framework.set_rom_url(loader, location)?;
        info!("boot ROM override set to {}", location);
        Ok(())
    }

    /// Read back the boot loader's firmware image location.
    ///
    /// Allowed after consumption.
    pub fn get_firmware_image_location(
        &self,
        loader: &F::BootLoader,
    ) -> Result<Option<FirmwareImageLocation>> {
        self.require(Feature::BootRomOverride)?;
        self.framework.rom_url(loader)
    }

    /// Attach a GDB debug stub under the bridge's reattach policy.
    pub fn attach_debug_stub(
        &self,
        config: &mut F::Configuration,
        descriptor: &DebugStubDescriptor,
    ) -> Result<()> {
        self.attach_debug_stub_with_policy(config, descriptor, self.reattach)
    }

    /// Attach a GDB debug stub under an explicit reattach policy.
    ///
    /// The framework receives a fresh object carrying a copy of the port.
    pub fn attach_debug_stub_with_policy(
        &self,
        config: &mut F::Configuration,
        descriptor: &DebugStubDescriptor,
        policy: ReattachPolicy,
    ) -> Result<()> {
        self.ensure_unconsumed(config, "attach debug stub")?;
        self.require(Feature::DebugStubAttachment)?;
        let port = descriptor.validated_port()?;

        if let Some(previous) = self.framework.installed_debug_stub(config) {
            match policy {
                ReattachPolicy::Reject => {
                    return Err(Error::AlreadyAttached(Feature::DebugStubAttachment))
                }
                ReattachPolicy::Replace => {
                    debug!(
                        "replacing debug stub on port {} with port {}",
                        previous.listen_port(),
                        port
                    );
                }
            }
        }

        self.framework.install_debug_stub(config, port)?;
        info!("debug stub attached on port {}", port);
        Ok(())
    }

    /// Descriptor of the stub currently attached, if any.
    pub fn attached_debug_stub(&self, config: &F::Configuration) -> Option<DebugStubDescriptor> {
        self.framework.installed_debug_stub(config)
    }

    /// Construct a PL011 serial port configuration.
    ///
    /// The result is an ordinary serial port configuration of the framework;
    /// no configuration is touched.
    pub fn create_extended_serial_transport(&self) -> Result<F::SerialPort> {
        self.require(Feature::SerialTransportExtension)?;
        self.framework.new_extended_serial_port()
    }

    /// Construct a PL011 port and append it to the configuration's serial ports.
    ///
    /// Returns the index of the new port.
    pub fn attach_extended_serial_transport(&self, config: &mut F::Configuration) -> Result<usize> {
        self.ensure_unconsumed(config, "attach serial transport")?;
        let port = self.create_extended_serial_transport()?;
        let index = self.framework.push_serial_port(config, port)?;
        info!("PL011 serial port attached at index {}", index);
        Ok(index)
    }

    /// Lifecycle state of one attachment point.
    pub fn attachment_state(&self, config: &F::Configuration, feature: Feature) -> AttachmentState {
        if self.framework.is_consumed(config) {
            return AttachmentState::Consumed;
        }
        let attached = match feature {
            Feature::BootRomOverride => {
                self.is_feature_supported(feature)
                    && self
                        .framework
                        .boot_loader(config)
                        .map(|loader| matches!(self.framework.rom_url(loader), Ok(Some(_))))
                        .unwrap_or(false)
            }
            Feature::DebugStubAttachment => self.framework.installed_debug_stub(config).is_some(),
            Feature::SerialTransportExtension => self
                .framework
                .serial_transports(config)
                .contains(&SerialTransportKind::Pl011),
        };
        if attached {
            AttachmentState::Attached
        } else {
            AttachmentState::Unattached
        }
    }
}
