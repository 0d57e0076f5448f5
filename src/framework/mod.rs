//! Seam between the bridge and the hypervisor framework's object model.
//!
//! The bridge never touches framework objects directly; it goes through
//! [`Framework`], which exposes read-only runtime introspection plus the
//! handful of private operations the bridge applies.
//!
//! Implementations:
//! - **macOS**: `VzFramework`, the live Virtualization.framework via `objc2`
//! - **All platforms**: [`SimulatedFramework`](simulated::SimulatedFramework),
//!   an in-process object model with per-release profiles

pub mod simulated;

#[cfg(target_os = "macos")]
pub mod vz;

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::debug_stub::DebugStubDescriptor;
use crate::feature::{Lookup, Requirement, PL011_SERIAL_PORT_CLASS, VIRTIO_CONSOLE_SERIAL_PORT_CLASS};
use crate::firmware::FirmwareImageLocation;
use crate::{Error, Result};

/// Operating system release the framework ships with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameworkVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FrameworkVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for FrameworkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FrameworkVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = [0u32; 3];
        let fields: Vec<&str> = s.trim().split('.').collect();
        if fields.is_empty() || fields.len() > 3 {
            return Err(Error::InvalidArgument(format!("invalid version '{}'", s)));
        }
        for (slot, field) in parts.iter_mut().zip(&fields) {
            *slot = field
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid version '{}'", s)))?;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl Serialize for FrameworkVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Lifecycle of one attachment point on a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Unattached,
    Attached,
    /// The configuration was handed to instantiation. Irreversible.
    Consumed,
}

/// Transport backing a serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialTransportKind {
    /// Public virtio console port.
    VirtioConsole,
    /// Private PL011 UART.
    Pl011,
    /// Any other class, by name.
    Other(String),
}

impl SerialTransportKind {
    pub fn from_class_name(name: &str) -> Self {
        match name {
            VIRTIO_CONSOLE_SERIAL_PORT_CLASS => SerialTransportKind::VirtioConsole,
            PL011_SERIAL_PORT_CLASS => SerialTransportKind::Pl011,
            other => SerialTransportKind::Other(other.to_string()),
        }
    }
}

/// Object model of a hypervisor framework version.
///
/// The private operations (`set_rom_url`, `install_debug_stub`,
/// `new_extended_serial_port`, ...) must check their receiver before
/// sending anything and return [`Error::UnsupportedOperation`] or
/// [`Error::InvalidArgument`] instead of faulting. They do not check
/// lifecycle state; [`Bridge`](crate::bridge::Bridge) does that first.
pub trait Framework {
    /// Boot loader configuration object.
    type BootLoader;
    /// Virtual machine configuration aggregate.
    type Configuration;
    /// Serial port configuration, any variant.
    type SerialPort;

    /// Release of the running framework.
    fn version(&self) -> FrameworkVersion;

    /// Answer one introspection question without invoking anything.
    fn lookup(&self, requirement: &Requirement) -> Lookup;

    /// Whether the configuration has been handed to instantiation.
    fn is_consumed(&self, config: &Self::Configuration) -> bool;

    /// Whether the boot loader's owning configuration has been consumed.
    fn is_boot_loader_consumed(&self, loader: &Self::BootLoader) -> bool;

    /// Boot loader attached to the configuration, if any.
    fn boot_loader<'c>(&self, config: &'c Self::Configuration) -> Option<&'c Self::BootLoader>;

    /// Mutable access to the configuration's boot loader.
    fn boot_loader_mut<'c>(
        &self,
        config: &'c mut Self::Configuration,
    ) -> Option<&'c mut Self::BootLoader>;

    /// Whether the loader's class responds to the private ROM setter.
    ///
    /// Introspection only; nothing is sent.
    fn accepts_rom_override(&self, loader: &Self::BootLoader) -> bool;

    /// Send the private ROM setter.
    fn set_rom_url(&self, loader: &mut Self::BootLoader, location: &FirmwareImageLocation)
        -> Result<()>;

    /// Send the private ROM getter.
    fn rom_url(&self, loader: &Self::BootLoader) -> Result<Option<FirmwareImageLocation>>;

    /// Build a fresh private stub descriptor for `port` and install it,
    /// replacing whatever was installed before.
    fn install_debug_stub(&self, config: &mut Self::Configuration, port: u16) -> Result<()>;

    /// Descriptor currently installed on the configuration.
    fn installed_debug_stub(&self, config: &Self::Configuration) -> Option<DebugStubDescriptor>;

    /// Construct the private PL011 serial port configuration.
    fn new_extended_serial_port(&self) -> Result<Self::SerialPort>;

    /// Construct the public virtio console serial port configuration.
    fn new_virtio_console_port(&self) -> Result<Self::SerialPort>;

    /// Transports of the configuration's serial ports, in order.
    fn serial_transports(&self, config: &Self::Configuration) -> Vec<SerialTransportKind>;

    /// Append to the configuration's serial port list; returns the new index.
    fn push_serial_port(&self, config: &mut Self::Configuration, port: Self::SerialPort)
        -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_partial_forms() {
        assert_eq!(
            "13".parse::<FrameworkVersion>().unwrap(),
            FrameworkVersion::new(13, 0, 0)
        );
        assert_eq!(
            "14.2.1".parse::<FrameworkVersion>().unwrap(),
            FrameworkVersion::new(14, 2, 1)
        );
        assert!("14.x".parse::<FrameworkVersion>().is_err());
        assert!("1.2.3.4".parse::<FrameworkVersion>().is_err());
    }

    #[test]
    fn version_orders_numerically() {
        assert!(FrameworkVersion::new(12, 10, 0) > FrameworkVersion::new(12, 9, 3));
        assert_eq!(FrameworkVersion::new(13, 1, 0).to_string(), "13.1.0");
    }

    #[test]
    fn transport_kind_from_class() {
        assert_eq!(
            SerialTransportKind::from_class_name(PL011_SERIAL_PORT_CLASS),
            SerialTransportKind::Pl011
        );
        assert_eq!(
            SerialTransportKind::from_class_name("VZSpiceAgentPortAttachment"),
            SerialTransportKind::Other("VZSpiceAgentPortAttachment".into())
        );
    }
}
