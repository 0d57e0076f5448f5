//! In-process stand-in for the hypervisor framework.
//!
//! Models the parts of the runtime the bridge relies on: registered
//! classes, their superclass chains and the selectors their instances
//! respond to. Release profiles decide which private entries exist, and
//! individual classes or selectors can be removed to mimic a framework
//! update that renamed or dropped them.
//!
//! Sending a selector the receiver does not respond to returns an error
//! instead of raising, and every private message that is actually sent is
//! counted so tests can tell probing apart from invoking.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::capability::probe_feature;
use crate::debug_stub::DebugStubDescriptor;
use crate::feature::{
    Feature, Lookup, Requirement, GDB_DEBUG_STUB_CLASS, MACOS_BOOT_LOADER_CLASS,
    PL011_SERIAL_PORT_CLASS, ROM_URL_SELECTOR, SERIAL_PORT_CONFIGURATION_CLASS,
    SET_DEBUG_STUB_SELECTOR, SET_PORT_SELECTOR, SET_ROM_URL_SELECTOR,
    VIRTIO_CONSOLE_SERIAL_PORT_CLASS, VM_CONFIGURATION_CLASS,
};
use crate::firmware::FirmwareImageLocation;
use crate::framework::{Framework, FrameworkVersion, SerialTransportKind};
use crate::{Error, Result};

const ROOT_CLASS: &str = "NSObject";
const BOOT_LOADER_CLASS: &str = "VZBootLoader";
const LINUX_BOOT_LOADER_CLASS: &str = "VZLinuxBootLoader";

/// Framework releases with the private entries each one is assumed to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseProfile {
    /// No macOS boot loader, no private entries.
    MacOs11,
    /// Boot ROM override and debug stub.
    MacOs12,
    /// Adds the PL011 serial port.
    MacOs13,
    /// Everything the bridge knows about.
    Latest,
}

impl ReleaseProfile {
    pub const ALL: [ReleaseProfile; 4] = [
        ReleaseProfile::MacOs11,
        ReleaseProfile::MacOs12,
        ReleaseProfile::MacOs13,
        ReleaseProfile::Latest,
    ];

    pub fn version(self) -> FrameworkVersion {
        match self {
            ReleaseProfile::MacOs11 => FrameworkVersion::new(11, 0, 0),
            ReleaseProfile::MacOs12 => FrameworkVersion::new(12, 0, 0),
            ReleaseProfile::MacOs13 => FrameworkVersion::new(13, 0, 0),
            ReleaseProfile::Latest => FrameworkVersion::new(15, 0, 0),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ReleaseProfile::MacOs11 => "macos11",
            ReleaseProfile::MacOs12 => "macos12",
            ReleaseProfile::MacOs13 => "macos13",
            ReleaseProfile::Latest => "latest",
        }
    }
}

impl fmt::Display for ReleaseProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReleaseProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        let normalized = normalized.strip_prefix("macos").unwrap_or(&normalized);
        match normalized {
            "11" => Ok(ReleaseProfile::MacOs11),
            "12" => Ok(ReleaseProfile::MacOs12),
            "13" => Ok(ReleaseProfile::MacOs13),
            "latest" => Ok(ReleaseProfile::Latest),
            _ => Err(Error::InvalidArgument(format!(
                "unknown release profile '{}' (expected macos11, macos12, macos13 or latest)",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SimClass {
    superclass: Option<String>,
    selectors: BTreeSet<String>,
}

/// Simulated framework object model.
#[derive(Debug)]
pub struct SimulatedFramework {
    version: FrameworkVersion,
    classes: BTreeMap<String, SimClass>,
    inconclusive: BTreeSet<String>,
    invocations: Cell<usize>,
}

impl SimulatedFramework {
    /// Public classes only, no private entries.
    pub fn new(version: FrameworkVersion) -> Self {
        let framework = Self {
            version,
            classes: BTreeMap::new(),
            inconclusive: BTreeSet::new(),
            invocations: Cell::new(0),
        };
        framework
            .with_class(ROOT_CLASS, None)
            .with_class(BOOT_LOADER_CLASS, Some(ROOT_CLASS))
            .with_class(LINUX_BOOT_LOADER_CLASS, Some(BOOT_LOADER_CLASS))
            .with_selector(LINUX_BOOT_LOADER_CLASS, "setCommandLine:")
            .with_class(VM_CONFIGURATION_CLASS, Some(ROOT_CLASS))
            .with_selector(VM_CONFIGURATION_CLASS, "setBootLoader:")
            .with_selector(VM_CONFIGURATION_CLASS, "setSerialPorts:")
            .with_selector(VM_CONFIGURATION_CLASS, "validateWithError:")
            .with_class(SERIAL_PORT_CONFIGURATION_CLASS, Some(ROOT_CLASS))
            .with_selector(SERIAL_PORT_CONFIGURATION_CLASS, "setAttachment:")
            .with_class(
                VIRTIO_CONSOLE_SERIAL_PORT_CLASS,
                Some(SERIAL_PORT_CONFIGURATION_CLASS),
            )
    }

    /// Object model of a known release.
    pub fn profile(profile: ReleaseProfile) -> Self {
        let mut framework = Self::new(profile.version());
        if profile != ReleaseProfile::MacOs11 {
            framework = framework
                .with_class(MACOS_BOOT_LOADER_CLASS, Some(BOOT_LOADER_CLASS))
                .with_feature(Feature::BootRomOverride)
                .with_feature(Feature::DebugStubAttachment);
        }
        if matches!(profile, ReleaseProfile::MacOs13 | ReleaseProfile::Latest) {
            framework = framework.with_feature(Feature::SerialTransportExtension);
        }
        framework
    }

    /// Register a class (or re-parent an existing one).
    pub fn with_class(mut self, class: &str, superclass: Option<&str>) -> Self {
        let entry = self.classes.entry(class.to_string()).or_default();
        entry.superclass = superclass.map(str::to_string);
        self
    }

    /// Make instances of `class` respond to `selector`, registering the class if needed.
    pub fn with_selector(mut self, class: &str, selector: &str) -> Self {
        if !self.classes.contains_key(class) {
            self = self.with_class(class, Some(ROOT_CLASS));
        }
        if let Some(entry) = self.classes.get_mut(class) {
            entry.selectors.insert(selector.to_string());
        }
        self
    }

    /// Add every runtime entry the feature requires.
    pub fn with_feature(mut self, feature: Feature) -> Self {
        for requirement in feature.requirements() {
            self = match *requirement {
                Requirement::Class { class } => {
                    if self.classes.contains_key(class) {
                        self
                    } else {
                        let superclass = if class == PL011_SERIAL_PORT_CLASS {
                            SERIAL_PORT_CONFIGURATION_CLASS
                        } else {
                            ROOT_CLASS
                        };
                        self.with_class(class, Some(superclass))
                    }
                }
                Requirement::RespondsTo { class, selector } => self.with_selector(class, selector),
                Requirement::DescendsFrom { class, ancestor } => {
                    if self.descends(class, ancestor) {
                        self
                    } else {
                        self.with_class(class, Some(ancestor))
                    }
                }
            };
        }
        self
    }

    /// Unregister a class, as if a release dropped it.
    pub fn without_class(mut self, class: &str) -> Self {
        self.classes.remove(class);
        self
    }

    /// Remove one selector from a class.
    pub fn without_selector(mut self, class: &str, selector: &str) -> Self {
        if let Some(entry) = self.classes.get_mut(class) {
            entry.selectors.remove(selector);
        }
        self
    }

    /// Make every lookup about `class` come back inconclusive.
    pub fn with_inconclusive_class(mut self, class: &str) -> Self {
        self.inconclusive.insert(class.to_string());
        self
    }

    /// Number of private messages actually sent so far.
    pub fn private_invocations(&self) -> usize {
        self.invocations.get()
    }

    /// Public macOS boot loader. Absent before macOS 12.
    pub fn mac_os_boot_loader(&self) -> Result<SimBootLoader> {
        if !self.classes.contains_key(MACOS_BOOT_LOADER_CLASS) {
            return Err(Error::Framework(format!(
                "{} is not available on framework {}",
                MACOS_BOOT_LOADER_CLASS, self.version
            )));
        }
        Ok(SimBootLoader::new(MACOS_BOOT_LOADER_CLASS))
    }

    /// Public Linux kernel boot loader.
    pub fn linux_boot_loader(&self) -> SimBootLoader {
        SimBootLoader::new(LINUX_BOOT_LOADER_CLASS)
    }

    /// Validate the configuration and boot a virtual machine from it.
    ///
    /// On success the configuration and its boot loader become consumed.
    pub fn instantiate(&self, config: &mut SimConfiguration) -> Result<SimVirtualMachine> {
        if config.consumed {
            return Err(Error::PreconditionViolated(
                "configuration was already used to instantiate a virtual machine".into(),
            ));
        }

        let loader = config
            .boot_loader
            .as_ref()
            .ok_or_else(|| Error::Framework("a boot loader is required".into()))?;
        if !self.classes.contains_key(&loader.class) {
            return Err(Error::Framework(format!(
                "boot loader class {} is not registered",
                loader.class
            )));
        }
        if let Some(rom) = &loader.rom {
            rom.ensure_readable()
                .map_err(|e| Error::Framework(format!("boot ROM rejected: {}", e)))?;
        }
        for port in &config.serial_ports {
            if !self.descends(&port.class, SERIAL_PORT_CONFIGURATION_CLASS) {
                return Err(Error::Framework(format!(
                    "serial port class {} is not a registered serial port configuration",
                    port.class
                )));
            }
        }
        if config.debug_stub.is_some() && !self.classes.contains_key(GDB_DEBUG_STUB_CLASS) {
            return Err(Error::Framework(format!(
                "debug stub class {} is not registered",
                GDB_DEBUG_STUB_CLASS
            )));
        }

        let vm = SimVirtualMachine {
            version: self.version,
            rom: loader.rom.clone(),
            debug_port: config.debug_stub.as_ref().map(|stub| stub.port),
            serial_transports: self.serial_transports(config),
        };

        config.consumed = true;
        if let Some(loader) = config.boot_loader.as_mut() {
            loader.consumed = true;
        }
        debug!("simulated framework {} instantiated {:?}", self.version, vm);
        Ok(vm)
    }

    fn responds(&self, class: &str, selector: &str) -> bool {
        let mut current = Some(class);
        while let Some(name) = current {
            let Some(entry) = self.classes.get(name) else {
                return false;
            };
            if entry.selectors.contains(selector) {
                return true;
            }
            current = entry.superclass.as_deref();
        }
        false
    }

    fn descends(&self, class: &str, ancestor: &str) -> bool {
        let mut current = Some(class);
        while let Some(name) = current {
            let Some(entry) = self.classes.get(name) else {
                return false;
            };
            if name == ancestor {
                return true;
            }
            current = entry.superclass.as_deref();
        }
        false
    }

    /// Deliver a private message, or explain why it cannot be delivered.
    fn send(&self, receiver: &str, selector: &str, feature: Feature) -> Result<()> {
        if !self.responds(receiver, selector) {
            if probe_feature(self, feature).is_available() {
                return Err(Error::InvalidArgument(format!(
                    "{} does not respond to {}",
                    receiver, selector
                )));
            }
            return Err(Error::unsupported(
                feature,
                format!("-[{} {}] is not implemented", receiver, selector),
            ));
        }
        self.invocations.set(self.invocations.get() + 1);
        Ok(())
    }
}

impl Framework for SimulatedFramework {
    type BootLoader = SimBootLoader;
    type Configuration = SimConfiguration;
    type SerialPort = SimSerialPort;

    fn version(&self) -> FrameworkVersion {
        self.version
    }

    fn lookup(&self, requirement: &Requirement) -> Lookup {
        if self.inconclusive.contains(requirement.class()) {
            return Lookup::Inconclusive(format!(
                "runtime lookup of {} failed",
                requirement.class()
            ));
        }
        let present = match *requirement {
            Requirement::Class { class } => self.classes.contains_key(class),
            Requirement::RespondsTo { class, selector } => self.responds(class, selector),
            Requirement::DescendsFrom { class, ancestor } => self.descends(class, ancestor),
        };
        if present {
            Lookup::Present
        } else {
            Lookup::Missing
        }
    }

    fn is_consumed(&self, config: &SimConfiguration) -> bool {
        config.consumed
    }

    fn is_boot_loader_consumed(&self, loader: &SimBootLoader) -> bool {
        loader.consumed
    }

    fn boot_loader<'c>(&self, config: &'c SimConfiguration) -> Option<&'c SimBootLoader> {
        config.boot_loader.as_ref()
    }

    fn boot_loader_mut<'c>(&self, config: &'c mut SimConfiguration) -> Option<&'c mut SimBootLoader> {
        config.boot_loader.as_mut()
    }

    fn accepts_rom_override(&self, loader: &SimBootLoader) -> bool {
        self.responds(&loader.class, SET_ROM_URL_SELECTOR)
    }

    fn set_rom_url(&self, loader: &mut SimBootLoader, location: &FirmwareImageLocation) -> Result<()> {
        self.send(&loader.class, SET_ROM_URL_SELECTOR, Feature::BootRomOverride)?;
        loader.rom = Some(location.clone());
        Ok(())
    }

    fn rom_url(&self, loader: &SimBootLoader) -> Result<Option<FirmwareImageLocation>> {
        self.send(&loader.class, ROM_URL_SELECTOR, Feature::BootRomOverride)?;
        Ok(loader.rom.clone())
    }

    fn install_debug_stub(&self, config: &mut SimConfiguration, port: u16) -> Result<()> {
        if !self.classes.contains_key(GDB_DEBUG_STUB_CLASS) {
            return Err(Error::unsupported(
                Feature::DebugStubAttachment,
                format!("class {} is not registered", GDB_DEBUG_STUB_CLASS),
            ));
        }
        self.send(GDB_DEBUG_STUB_CLASS, SET_PORT_SELECTOR, Feature::DebugStubAttachment)?;
        let stub = SimDebugStub { port };
        self.send(
            VM_CONFIGURATION_CLASS,
            SET_DEBUG_STUB_SELECTOR,
            Feature::DebugStubAttachment,
        )?;
        config.debug_stub = Some(stub);
        Ok(())
    }

    fn installed_debug_stub(&self, config: &SimConfiguration) -> Option<DebugStubDescriptor> {
        config
            .debug_stub
            .as_ref()
            .map(|stub| DebugStubDescriptor::from(stub.port))
    }

    fn new_extended_serial_port(&self) -> Result<SimSerialPort> {
        if !self.classes.contains_key(PL011_SERIAL_PORT_CLASS) {
            return Err(Error::unsupported(
                Feature::SerialTransportExtension,
                format!("class {} is not registered", PL011_SERIAL_PORT_CLASS),
            ));
        }
        if !self.descends(PL011_SERIAL_PORT_CLASS, SERIAL_PORT_CONFIGURATION_CLASS) {
            return Err(Error::unsupported(
                Feature::SerialTransportExtension,
                format!(
                    "{} is not a {}",
                    PL011_SERIAL_PORT_CLASS, SERIAL_PORT_CONFIGURATION_CLASS
                ),
            ));
        }
        self.invocations.set(self.invocations.get() + 1);
        Ok(SimSerialPort::new(PL011_SERIAL_PORT_CLASS))
    }

    fn new_virtio_console_port(&self) -> Result<SimSerialPort> {
        Ok(SimSerialPort::new(VIRTIO_CONSOLE_SERIAL_PORT_CLASS))
    }

    fn serial_transports(&self, config: &SimConfiguration) -> Vec<SerialTransportKind> {
        config
            .serial_ports
            .iter()
            .map(SimSerialPort::transport)
            .collect()
    }

    fn push_serial_port(&self, config: &mut SimConfiguration, port: SimSerialPort) -> Result<usize> {
        config.push_serial_port(port)
    }
}

/// Boot loader configuration object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimBootLoader {
    class: String,
    rom: Option<FirmwareImageLocation>,
    consumed: bool,
}

impl SimBootLoader {
    fn new(class: &str) -> Self {
        Self {
            class: class.to_string(),
            rom: None,
            consumed: false,
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class
    }

    /// ROM override stored on the object, read without sending anything.
    pub fn stored_rom(&self) -> Option<&FirmwareImageLocation> {
        self.rom.as_ref()
    }
}

/// Serial port configuration object of any class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimSerialPort {
    class: String,
}

impl SimSerialPort {
    fn new(class: &str) -> Self {
        Self {
            class: class.to_string(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class
    }

    pub fn transport(&self) -> SerialTransportKind {
        SerialTransportKind::from_class_name(&self.class)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SimDebugStub {
    port: u16,
}

/// Virtual machine configuration aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimConfiguration {
    boot_loader: Option<SimBootLoader>,
    debug_stub: Option<SimDebugStub>,
    serial_ports: Vec<SimSerialPort>,
    consumed: bool,
}

impl SimConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Public boot loader setter.
    pub fn set_boot_loader(&mut self, loader: SimBootLoader) -> Result<()> {
        self.ensure_mutable()?;
        self.boot_loader = Some(loader);
        Ok(())
    }

    pub fn boot_loader(&self) -> Option<&SimBootLoader> {
        self.boot_loader.as_ref()
    }

    /// Public serial port list append.
    pub fn push_serial_port(&mut self, port: SimSerialPort) -> Result<usize> {
        self.ensure_mutable()?;
        self.serial_ports.push(port);
        Ok(self.serial_ports.len() - 1)
    }

    pub fn serial_ports(&self) -> &[SimSerialPort] {
        &self.serial_ports
    }

    /// Port of the installed private stub object.
    pub fn debug_stub_port(&self) -> Option<u16> {
        self.debug_stub.as_ref().map(|stub| stub.port)
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.consumed {
            return Err(Error::PreconditionViolated(
                "configuration was already used to instantiate a virtual machine".into(),
            ));
        }
        Ok(())
    }
}

/// What a simulated instantiation captured from its configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimVirtualMachine {
    pub version: FrameworkVersion,
    pub rom: Option<FirmwareImageLocation>,
    pub debug_port: Option<u16>,
    pub serial_transports: Vec<SerialTransportKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_names_parse() {
        for profile in ReleaseProfile::ALL {
            assert_eq!(profile.to_string().parse::<ReleaseProfile>().unwrap(), profile);
        }
        assert_eq!("13".parse::<ReleaseProfile>().unwrap(), ReleaseProfile::MacOs13);
        assert_eq!("macOS12".parse::<ReleaseProfile>().unwrap(), ReleaseProfile::MacOs12);
        assert!("macos10".parse::<ReleaseProfile>().is_err());
    }

    #[test]
    fn selectors_are_inherited() {
        let framework = SimulatedFramework::profile(ReleaseProfile::Latest);
        assert!(framework.responds(VIRTIO_CONSOLE_SERIAL_PORT_CLASS, "setAttachment:"));
        assert!(framework.descends(PL011_SERIAL_PORT_CLASS, ROOT_CLASS));
        assert!(!framework.responds(LINUX_BOOT_LOADER_CLASS, SET_ROM_URL_SELECTOR));
    }

    #[test]
    fn macos11_has_no_macos_boot_loader() {
        let framework = SimulatedFramework::profile(ReleaseProfile::MacOs11);
        assert!(matches!(
            framework.mac_os_boot_loader(),
            Err(Error::Framework(_))
        ));
    }

    #[test]
    fn sending_to_incompatible_receiver_is_invalid_argument() {
        let framework = SimulatedFramework::profile(ReleaseProfile::Latest);
        let mut loader = framework.linux_boot_loader();
        let location = FirmwareImageLocation::parse("/tmp/rom.bin").unwrap();
        let err = framework.set_rom_url(&mut loader, &location).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(framework.private_invocations(), 0);
        assert!(loader.stored_rom().is_none());
    }

    #[test]
    fn sending_missing_selector_is_unsupported() {
        let framework = SimulatedFramework::profile(ReleaseProfile::MacOs12)
            .without_selector(VM_CONFIGURATION_CLASS, SET_DEBUG_STUB_SELECTOR);
        let mut config = SimConfiguration::new();
        let err = framework.install_debug_stub(&mut config, 1234).unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(config.debug_stub_port(), None);
    }

    #[test]
    fn reparented_extension_is_rejected() {
        let framework = SimulatedFramework::profile(ReleaseProfile::Latest)
            .with_class(PL011_SERIAL_PORT_CLASS, Some(ROOT_CLASS));
        assert!(framework.new_extended_serial_port().unwrap_err().is_unsupported());
    }

    #[test]
    fn instantiate_requires_boot_loader() {
        let framework = SimulatedFramework::profile(ReleaseProfile::Latest);
        let mut config = SimConfiguration::new();
        assert!(matches!(
            framework.instantiate(&mut config),
            Err(Error::Framework(_))
        ));
        assert!(!config.is_consumed());
    }

    #[test]
    fn instantiate_consumes_configuration_once() {
        let framework = SimulatedFramework::profile(ReleaseProfile::Latest);
        let mut config = SimConfiguration::new();
        config.set_boot_loader(framework.linux_boot_loader()).unwrap();
        config
            .push_serial_port(framework.new_virtio_console_port().unwrap())
            .unwrap();

        let vm = framework.instantiate(&mut config).unwrap();
        assert_eq!(vm.serial_transports, vec![SerialTransportKind::VirtioConsole]);
        assert!(config.is_consumed());
        assert!(framework.is_boot_loader_consumed(config.boot_loader().unwrap()));

        assert!(matches!(
            framework.instantiate(&mut config),
            Err(Error::PreconditionViolated(_))
        ));
        assert!(matches!(
            config.push_serial_port(framework.new_virtio_console_port().unwrap()),
            Err(Error::PreconditionViolated(_))
        ));
    }

    #[test]
    fn instantiate_rejects_ports_from_another_release() {
        let newer = SimulatedFramework::profile(ReleaseProfile::Latest);
        let older = SimulatedFramework::profile(ReleaseProfile::MacOs12);
        let mut config = SimConfiguration::new();
        config.set_boot_loader(older.mac_os_boot_loader().unwrap()).unwrap();
        config
            .push_serial_port(newer.new_extended_serial_port().unwrap())
            .unwrap();
        assert!(matches!(
            older.instantiate(&mut config),
            Err(Error::Framework(_))
        ));
    }
}
