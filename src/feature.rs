//! Private extension points and what the runtime must expose for each.
//!
//! A [`Feature`] is supported only when every one of its [`Requirement`]s
//! is present in the running framework's object model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Public boot loader class carrying the private ROM accessors.
pub const MACOS_BOOT_LOADER_CLASS: &str = "VZMacOSBootLoader";
/// Private ROM setter on [`MACOS_BOOT_LOADER_CLASS`].
pub const SET_ROM_URL_SELECTOR: &str = "_setROMURL:";
/// Private ROM getter on [`MACOS_BOOT_LOADER_CLASS`].
pub const ROM_URL_SELECTOR: &str = "_romURL";

/// Public VM configuration class.
pub const VM_CONFIGURATION_CLASS: &str = "VZVirtualMachineConfiguration";
/// Private debug stub setter on [`VM_CONFIGURATION_CLASS`].
pub const SET_DEBUG_STUB_SELECTOR: &str = "_setDebugStub:";
/// Private GDB stub descriptor class.
pub const GDB_DEBUG_STUB_CLASS: &str = "_VZGDBDebugStubConfiguration";
/// Port setter on [`GDB_DEBUG_STUB_CLASS`].
pub const SET_PORT_SELECTOR: &str = "setPort:";

/// Public base class of every serial port configuration.
pub const SERIAL_PORT_CONFIGURATION_CLASS: &str = "VZSerialPortConfiguration";
/// Private PL011 UART serial port configuration class.
pub const PL011_SERIAL_PORT_CLASS: &str = "_VZPL011SerialPortConfiguration";
/// Public virtio console serial port configuration class.
pub const VIRTIO_CONSOLE_SERIAL_PORT_CLASS: &str = "VZVirtioConsoleDeviceSerialPortConfiguration";

/// Optional private capability the bridge can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Custom firmware image on the macOS boot loader.
    BootRomOverride,
    /// GDB remote stub on the VM configuration.
    DebugStubAttachment,
    /// PL011 UART serial port variant.
    SerialTransportExtension,
}

impl Feature {
    /// Every feature, in probe order.
    pub const ALL: [Feature; 3] = [
        Feature::BootRomOverride,
        Feature::DebugStubAttachment,
        Feature::SerialTransportExtension,
    ];

    /// Stable identifier used in settings files and CLI output.
    pub fn id(self) -> &'static str {
        match self {
            Feature::BootRomOverride => "boot_rom_override",
            Feature::DebugStubAttachment => "debug_stub_attachment",
            Feature::SerialTransportExtension => "serial_transport_extension",
        }
    }

    /// Object-model entries that must all be present for this feature.
    pub fn requirements(self) -> &'static [Requirement] {
        match self {
            Feature::BootRomOverride => &[
                Requirement::RespondsTo {
                    class: MACOS_BOOT_LOADER_CLASS,
                    selector: SET_ROM_URL_SELECTOR,
                },
                Requirement::RespondsTo {
                    class: MACOS_BOOT_LOADER_CLASS,
                    selector: ROM_URL_SELECTOR,
                },
            ],
            Feature::DebugStubAttachment => &[
                Requirement::Class {
                    class: GDB_DEBUG_STUB_CLASS,
                },
                Requirement::RespondsTo {
                    class: GDB_DEBUG_STUB_CLASS,
                    selector: SET_PORT_SELECTOR,
                },
                Requirement::RespondsTo {
                    class: VM_CONFIGURATION_CLASS,
                    selector: SET_DEBUG_STUB_SELECTOR,
                },
            ],
            Feature::SerialTransportExtension => &[
                Requirement::Class {
                    class: PL011_SERIAL_PORT_CLASS,
                },
                Requirement::DescendsFrom {
                    class: PL011_SERIAL_PORT_CLASS,
                    ancestor: SERIAL_PORT_CONFIGURATION_CLASS,
                },
            ],
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::BootRomOverride => "boot ROM override",
            Feature::DebugStubAttachment => "debug stub attachment",
            Feature::SerialTransportExtension => "serial transport extension",
        };
        f.write_str(name)
    }
}

impl FromStr for Feature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Feature::ALL
            .into_iter()
            .find(|feature| feature.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown feature '{}'", s)))
    }
}

/// A single non-invoking question asked of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Requirement {
    /// The class is registered.
    Class { class: &'static str },
    /// Instances of the class respond to the selector.
    RespondsTo {
        class: &'static str,
        selector: &'static str,
    },
    /// The class has `ancestor` somewhere in its superclass chain.
    DescendsFrom {
        class: &'static str,
        ancestor: &'static str,
    },
}

impl Requirement {
    /// Class the requirement is asked about.
    pub fn class(&self) -> &'static str {
        match self {
            Requirement::Class { class }
            | Requirement::RespondsTo { class, .. }
            | Requirement::DescendsFrom { class, .. } => class,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Class { class } => write!(f, "class {}", class),
            Requirement::RespondsTo { class, selector } => write!(f, "-[{} {}]", class, selector),
            Requirement::DescendsFrom { class, ancestor } => {
                write!(f, "{} subclass of {}", class, ancestor)
            }
        }
    }
}

/// Answer to a [`Requirement`] lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Present,
    Missing,
    /// The runtime could not answer; treated as missing.
    Inconclusive(String),
}
