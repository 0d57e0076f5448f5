//! Live Virtualization.framework object model via `objc2`.
//!
//! ## Probing
//!
//! Lookups go through the Objective-C runtime (`objc_getClass`,
//! `class_respondsToSelector`, superclass walk). Nothing is messaged while
//! probing.
//!
//! ## Sending
//!
//! Private selectors are only sent after the receiver's class has been
//! asked whether it responds to them. An unrecognized selector would raise
//! an Objective-C exception and abort the process, so every send below is
//! preceded by that check.
//!
//! ## Lifecycle
//!
//! The framework copies a configuration when a `VZVirtualMachine` is
//! created from it and keeps no record the bridge can query. The wrappers
//! here share a consumed flag between a configuration and its boot loader,
//! and [`VzFramework::consume`] sets it when the host takes the validated
//! configuration for instantiation.

// Several generated bindings are safe in some SDK versions and unsafe in others.
#![allow(unused_unsafe)]

use std::cell::Cell;
use std::ffi::CString;
use std::rc::Rc;

use objc2::rc::Retained;
use objc2::runtime::{AnyClass, AnyObject, Sel};
use objc2::{msg_send, sel};
use objc2_foundation::{NSArray, NSInteger, NSProcessInfo, NSString, NSURL};
use objc2_virtualization::{
    VZBootLoader, VZMacOSBootLoader, VZSerialPortConfiguration,
    VZVirtioConsoleDeviceSerialPortConfiguration, VZVirtualMachineConfiguration,
};
use tracing::{debug, info};

use crate::bridge::Bridge;
use crate::capability::{CapabilityCache, CapabilityTable};
use crate::debug_stub::DebugStubDescriptor;
use crate::feature::{
    Feature, Lookup, Requirement, GDB_DEBUG_STUB_CLASS, MACOS_BOOT_LOADER_CLASS,
    PL011_SERIAL_PORT_CLASS, SERIAL_PORT_CONFIGURATION_CLASS,
};
use crate::firmware::FirmwareImageLocation;
use crate::framework::{Framework, FrameworkVersion, SerialTransportKind};
use crate::{Error, Result};

fn find_class(name: &str) -> std::result::Result<Option<&'static AnyClass>, String> {
    let c_name =
        CString::new(name).map_err(|_| format!("class name {:?} contains a NUL byte", name))?;
    Ok(AnyClass::get(&c_name))
}

fn selector_named(name: &str) -> std::result::Result<Sel, String> {
    let c_name =
        CString::new(name).map_err(|_| format!("selector {:?} contains a NUL byte", name))?;
    Ok(Sel::register(&c_name))
}

fn descends_from(class: &AnyClass, ancestor: &AnyClass) -> bool {
    let mut current = Some(class);
    while let Some(cls) = current {
        if std::ptr::eq(cls, ancestor) {
            return true;
        }
        current = cls.superclass();
    }
    false
}

fn class_name(object: &AnyObject) -> String {
    object.class().name().to_string_lossy().into_owned()
}

fn responds(object: &AnyObject, selector: Sel) -> bool {
    object.class().responds_to(selector)
}

/// Load a class that one feature depends on, mapping absence to `UnsupportedOperation`.
fn feature_class(feature: Feature, name: &str) -> Result<&'static AnyClass> {
    find_class(name)
        .map_err(|reason| Error::unsupported(feature, reason))?
        .ok_or_else(|| Error::unsupported(feature, format!("class {} is not registered", name)))
}

/// Handle to the running Virtualization.framework.
#[derive(Debug)]
pub struct VzFramework {
    version: FrameworkVersion,
}

impl Default for VzFramework {
    fn default() -> Self {
        Self::new()
    }
}

impl VzFramework {
    /// Identify the framework by the host OS release.
    pub fn new() -> Self {
        let os = unsafe { NSProcessInfo::processInfo().operatingSystemVersion() };
        let version = FrameworkVersion::new(
            os.majorVersion.max(0) as u32,
            os.minorVersion.max(0) as u32,
            os.patchVersion.max(0) as u32,
        );
        debug!("VzFramework: host framework version {}", version);
        Self { version }
    }

    /// Capability table for this process, probed on first use.
    pub fn capabilities(&self) -> CapabilityTable {
        CapabilityCache::global().resolve(self)
    }

    /// Bridge over the live framework using the process-wide capability cache.
    pub fn bridge(&self) -> Bridge<'_, Self> {
        Bridge::cached(self, CapabilityCache::global())
    }

    /// Validate the configuration and hand it over for instantiation.
    ///
    /// Marks the configuration and its boot loader consumed; pass the
    /// returned object to `VZVirtualMachine::initWithConfiguration_queue`.
    pub fn consume(&self, config: &VzConfiguration) -> Result<Retained<VZVirtualMachineConfiguration>> {
        if config.is_consumed() {
            return Err(Error::PreconditionViolated(
                "configuration was already handed to instantiation".into(),
            ));
        }
        unsafe { config.inner.validateWithError() }.map_err(|e| {
            Error::Framework(format!(
                "VZ config validation: {}",
                e.localizedDescription()
            ))
        })?;
        config.consumed.set(true);
        info!("VzFramework: configuration validated and consumed");
        Ok(config.inner.clone())
    }
}

/// Boot loader configuration, tied to the lifecycle of its configuration.
pub struct VzBootLoader {
    inner: Retained<VZBootLoader>,
    consumed: Rc<Cell<bool>>,
}

impl VzBootLoader {
    /// New `VZMacOSBootLoader`. Fails where the class does not exist.
    pub fn mac_os() -> Result<Self> {
        if !matches!(find_class(MACOS_BOOT_LOADER_CLASS), Ok(Some(_))) {
            return Err(Error::Framework(format!(
                "{} is not available on this host",
                MACOS_BOOT_LOADER_CLASS
            )));
        }
        let loader = unsafe { VZMacOSBootLoader::new() };
        Ok(Self::from_retained(Retained::into_super(loader)))
    }

    /// Wrap any boot loader the host built through the public API.
    pub fn from_retained(inner: Retained<VZBootLoader>) -> Self {
        Self {
            inner,
            consumed: Rc::new(Cell::new(false)),
        }
    }

    pub fn as_vz(&self) -> &VZBootLoader {
        &self.inner
    }
}

/// VM configuration wrapper that records what the bridge installed.
pub struct VzConfiguration {
    inner: Retained<VZVirtualMachineConfiguration>,
    boot_loader: Option<VzBootLoader>,
    debug_stub: Option<DebugStubDescriptor>,
    consumed: Rc<Cell<bool>>,
}

impl Default for VzConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

impl VzConfiguration {
    pub fn new() -> Self {
        Self {
            inner: unsafe { VZVirtualMachineConfiguration::new() },
            boot_loader: None,
            debug_stub: None,
            consumed: Rc::new(Cell::new(false)),
        }
    }

    /// Install a boot loader through the public setter.
    pub fn set_boot_loader(&mut self, mut loader: VzBootLoader) -> Result<()> {
        if self.is_consumed() {
            return Err(Error::PreconditionViolated(
                "configuration was already handed to instantiation".into(),
            ));
        }
        loader.consumed = Rc::clone(&self.consumed);
        unsafe { self.inner.setBootLoader(Some(&loader.inner)) };
        self.boot_loader = Some(loader);
        Ok(())
    }

    /// The underlying configuration, for public-API plumbing.
    pub fn as_vz(&self) -> &VZVirtualMachineConfiguration {
        &self.inner
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.get()
    }
}

impl Framework for VzFramework {
    type BootLoader = VzBootLoader;
    type Configuration = VzConfiguration;
    type SerialPort = Retained<VZSerialPortConfiguration>;

    fn version(&self) -> FrameworkVersion {
        self.version
    }

    fn lookup(&self, requirement: &Requirement) -> Lookup {
        let class = match find_class(requirement.class()) {
            Ok(Some(class)) => class,
            Ok(None) => return Lookup::Missing,
            Err(reason) => return Lookup::Inconclusive(reason),
        };
        match *requirement {
            Requirement::Class { .. } => Lookup::Present,
            Requirement::RespondsTo { selector, .. } => match selector_named(selector) {
                Ok(sel) if class.responds_to(sel) => Lookup::Present,
                Ok(_) => Lookup::Missing,
                Err(reason) => Lookup::Inconclusive(reason),
            },
            Requirement::DescendsFrom { ancestor, .. } => match find_class(ancestor) {
                Ok(Some(ancestor)) if descends_from(class, ancestor) => Lookup::Present,
                Ok(_) => Lookup::Missing,
                Err(reason) => Lookup::Inconclusive(reason),
            },
        }
    }

    fn is_consumed(&self, config: &VzConfiguration) -> bool {
        config.is_consumed()
    }

    fn is_boot_loader_consumed(&self, loader: &VzBootLoader) -> bool {
        loader.consumed.get()
    }

    fn boot_loader<'c>(&self, config: &'c VzConfiguration) -> Option<&'c VzBootLoader> {
        config.boot_loader.as_ref()
    }

    fn boot_loader_mut<'c>(&self, config: &'c mut VzConfiguration) -> Option<&'c mut VzBootLoader> {
        config.boot_loader.as_mut()
    }

    fn accepts_rom_override(&self, loader: &VzBootLoader) -> bool {
        let receiver: &AnyObject = &loader.inner;
        responds(receiver, sel!(_setROMURL:))
    }

    fn set_rom_url(&self, loader: &mut VzBootLoader, location: &FirmwareImageLocation) -> Result<()> {
        let receiver: &AnyObject = &loader.inner;
        if !responds(receiver, sel!(_setROMURL:)) {
            return Err(Error::InvalidArgument(format!(
                "{} does not respond to _setROMURL:",
                class_name(receiver)
            )));
        }
        let path = location.path().to_str().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "firmware image path {} is not UTF-8",
                location.path().display()
            ))
        })?;
        let url = unsafe { NSURL::fileURLWithPath(&NSString::from_str(path)) };
        let _: () = unsafe { msg_send![receiver, _setROMURL: &*url] };
        Ok(())
    }

    fn rom_url(&self, loader: &VzBootLoader) -> Result<Option<FirmwareImageLocation>> {
        let receiver: &AnyObject = &loader.inner;
        if !responds(receiver, sel!(_romURL)) {
            return Err(Error::InvalidArgument(format!(
                "{} does not respond to _romURL",
                class_name(receiver)
            )));
        }
        let url: Option<Retained<NSURL>> = unsafe { msg_send![receiver, _romURL] };
        let Some(url) = url else {
            return Ok(None);
        };
        let path = unsafe { url.path() }
            .ok_or_else(|| Error::Framework("boot ROM URL has no file path".into()))?;
        FirmwareImageLocation::from_path(path.to_string()).map(Some)
    }

    fn install_debug_stub(&self, config: &mut VzConfiguration, port: u16) -> Result<()> {
        let feature = Feature::DebugStubAttachment;
        let class = feature_class(feature, GDB_DEBUG_STUB_CLASS)?;
        if !class.responds_to(sel!(setPort:)) {
            return Err(Error::unsupported(
                feature,
                format!("{} does not respond to setPort:", GDB_DEBUG_STUB_CLASS),
            ));
        }
        let receiver: &AnyObject = &config.inner;
        if !responds(receiver, sel!(_setDebugStub:)) {
            return Err(Error::unsupported(
                feature,
                format!("{} does not respond to _setDebugStub:", class_name(receiver)),
            ));
        }

        let stub: Option<Retained<AnyObject>> = unsafe { msg_send![class, new] };
        let stub = stub.ok_or_else(|| {
            Error::Framework(format!("+[{} new] returned nil", GDB_DEBUG_STUB_CLASS))
        })?;
        let _: () = unsafe { msg_send![&*stub, setPort: NSInteger::from(port)] };
        let _: () = unsafe { msg_send![receiver, _setDebugStub: &*stub] };

        config.debug_stub = Some(DebugStubDescriptor::from(port));
        debug!("VzFramework: installed {} on port {}", GDB_DEBUG_STUB_CLASS, port);
        Ok(())
    }

    fn installed_debug_stub(&self, config: &VzConfiguration) -> Option<DebugStubDescriptor> {
        config.debug_stub.clone()
    }

    fn new_extended_serial_port(&self) -> Result<Retained<VZSerialPortConfiguration>> {
        let feature = Feature::SerialTransportExtension;
        let class = feature_class(feature, PL011_SERIAL_PORT_CLASS)?;
        let base = feature_class(feature, SERIAL_PORT_CONFIGURATION_CLASS)?;
        if !descends_from(class, base) {
            return Err(Error::unsupported(
                feature,
                format!(
                    "{} is not a {}",
                    PL011_SERIAL_PORT_CLASS, SERIAL_PORT_CONFIGURATION_CLASS
                ),
            ));
        }

        let port: Option<Retained<AnyObject>> = unsafe { msg_send![class, new] };
        let port = port.ok_or_else(|| {
            Error::Framework(format!("+[{} new] returned nil", PL011_SERIAL_PORT_CLASS))
        })?;
        // Safety: the class descends from VZSerialPortConfiguration, checked above.
        Ok(unsafe { Retained::cast_unchecked::<VZSerialPortConfiguration>(port) })
    }

    fn new_virtio_console_port(&self) -> Result<Retained<VZSerialPortConfiguration>> {
        let port = unsafe { VZVirtioConsoleDeviceSerialPortConfiguration::new() };
        Ok(Retained::into_super(port))
    }

    fn serial_transports(&self, config: &VzConfiguration) -> Vec<SerialTransportKind> {
        let ports = unsafe { config.inner.serialPorts() };
        ports
            .iter()
            .map(|port| {
                let object: &AnyObject = &port;
                SerialTransportKind::from_class_name(&class_name(object))
            })
            .collect()
    }

    fn push_serial_port(
        &self,
        config: &mut VzConfiguration,
        port: Retained<VZSerialPortConfiguration>,
    ) -> Result<usize> {
        let mut ports = unsafe { config.inner.serialPorts() }.to_vec();
        ports.push(port);
        let array = NSArray::from_retained_slice(&ports);
        unsafe { config.inner.setSerialPorts(&array) };
        Ok(ports.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probing_the_host_never_panics() {
        let framework = VzFramework::new();
        let table = framework.capabilities();
        for (feature, availability) in table.iter() {
            println!("{}: {:?}", feature, availability);
        }
        assert_eq!(table.version(), &framework.version());
    }

    #[test]
    fn bogus_names_are_missing_or_inconclusive() {
        let framework = VzFramework::new();
        assert_eq!(
            framework.lookup(&Requirement::Class {
                class: "_VZNoSuchConfiguration"
            }),
            Lookup::Missing
        );
        assert!(matches!(
            framework.lookup(&Requirement::Class { class: "Bad\0Name" }),
            Lookup::Inconclusive(_)
        ));
    }

    #[test]
    fn unsupported_features_fail_cleanly() {
        let framework = VzFramework::new();
        let bridge = framework.bridge();
        let mut config = VzConfiguration::new();
        if !bridge.is_feature_supported(Feature::DebugStubAttachment) {
            let err = bridge
                .attach_debug_stub(&mut config, &DebugStubDescriptor::new(1234))
                .unwrap_err();
            assert!(err.is_unsupported());
        }
        if !bridge.is_feature_supported(Feature::SerialTransportExtension) {
            assert!(bridge.create_extended_serial_transport().is_err());
            assert!(framework.serial_transports(&config).is_empty());
        }
    }
}
