//! vz-bridge: guarded access to private hypervisor framework extension points
//!
//! Apple's Virtualization.framework carries several useful capabilities
//! behind private, undocumented entry points that can vanish or change in
//! any release. This crate reaches them without assuming they exist:
//!
//! - **Boot ROM override**: point a macOS boot loader at a custom firmware image
//! - **Debug stub**: attach a GDB remote stub to the guest's CPUs
//! - **PL011 serial**: create the UART serial port variant missing from the public API
//!
//! Every capability is probed through the Objective-C runtime before use.
//! An absent capability is reported as [`Error::UnsupportedOperation`], never
//! as a crash, so hosts can fall back to a public-only configuration.
//!
//! # Example
//!
//! ```no_run
//! use vz_bridge::framework::simulated::{ReleaseProfile, SimConfiguration, SimulatedFramework};
//! use vz_bridge::{Bridge, DebugStubDescriptor, Feature};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let framework = SimulatedFramework::profile(ReleaseProfile::MacOs13);
//!     let bridge = Bridge::new(&framework);
//!
//!     let mut config = SimConfiguration::new();
//!     config.set_boot_loader(framework.mac_os_boot_loader()?)?;
//!
//!     if bridge.is_feature_supported(Feature::DebugStubAttachment) {
//!         bridge.attach_debug_stub(&mut config, &DebugStubDescriptor::new(10086))?;
//!     }
//!     bridge.attach_extended_serial_transport(&mut config)?;
//!
//!     let vm = framework.instantiate(&mut config)?;
//!     println!("debug port: {:?}", vm.debug_port);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod bridge;
pub mod capability;
pub mod debug_stub;
pub mod error;
pub mod feature;
pub mod firmware;
pub mod framework;

// Host settings
pub mod apply;
pub mod settings;

// Re-exports for convenience
pub use bridge::{Bridge, ReattachPolicy};
pub use capability::{Availability, CapabilityCache, CapabilityTable};
pub use debug_stub::DebugStubDescriptor;
pub use error::{Error, Result};
pub use feature::Feature;
pub use firmware::FirmwareImageLocation;
pub use framework::{AttachmentState, Framework, FrameworkVersion, SerialTransportKind};

#[cfg(target_os = "macos")]
pub use framework::vz::{VzBootLoader, VzConfiguration, VzFramework};
