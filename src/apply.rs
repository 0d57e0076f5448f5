//! Applying host settings onto a configuration through the bridge.
//!
//! Optional features the framework lacks are skipped with a warning and
//! recorded in the report; the VM still boots with its public
//! configuration. Features listed in `require` fail the whole apply
//! instead, before anything is changed.

use serde::Serialize;
use tracing::{info, warn};

use crate::bridge::{Bridge, ReattachPolicy};
use crate::debug_stub::DebugStubDescriptor;
use crate::feature::Feature;
use crate::framework::{Framework, FrameworkVersion};
use crate::settings::{validate_settings, BridgeSettings, SerialMode};
use crate::{Error, Result};

/// What happened to one feature during [`apply_settings`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FeatureOutcome {
    NotRequested,
    Applied,
    Skipped { reason: String },
}

/// Summary of an [`apply_settings`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub framework_version: FrameworkVersion,
    pub boot_rom_override: FeatureOutcome,
    pub debug_stub_attachment: FeatureOutcome,
    pub serial_transport_extension: FeatureOutcome,
    /// One entry per settings serial port: its index in the configuration,
    /// or `None` when it was skipped.
    pub serial_ports: Vec<Option<usize>>,
}

impl ApplyReport {
    pub fn outcome(&self, feature: Feature) -> &FeatureOutcome {
        match feature {
            Feature::BootRomOverride => &self.boot_rom_override,
            Feature::DebugStubAttachment => &self.debug_stub_attachment,
            Feature::SerialTransportExtension => &self.serial_transport_extension,
        }
    }

    fn outcome_mut(&mut self, feature: Feature) -> &mut FeatureOutcome {
        match feature {
            Feature::BootRomOverride => &mut self.boot_rom_override,
            Feature::DebugStubAttachment => &mut self.debug_stub_attachment,
            Feature::SerialTransportExtension => &mut self.serial_transport_extension,
        }
    }

    /// Features that were requested but skipped.
    pub fn skipped(&self) -> Vec<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|feature| matches!(self.outcome(*feature), FeatureOutcome::Skipped { .. }))
            .collect()
    }
}

/// Apply `settings` to `config`.
///
/// Everything that can be checked ahead of time (lifecycle, required
/// capabilities, ROM target and readability, stub port, reattach
/// conflicts) is checked before the first change. A custom ROM is only
/// applied to a boot loader that takes one; on any other loader it is
/// skipped unless required.
pub fn apply_settings<F: Framework>(
    bridge: &Bridge<'_, F>,
    config: &mut F::Configuration,
    settings: &BridgeSettings,
) -> Result<ApplyReport> {
    validate_settings(settings)?;
    let framework = bridge.framework();
    if framework.is_consumed(config) {
        return Err(Error::PreconditionViolated(
            "cannot apply settings: configuration was already handed to instantiation".into(),
        ));
    }

    let mut report = ApplyReport {
        framework_version: *bridge.capabilities().version(),
        boot_rom_override: FeatureOutcome::NotRequested,
        debug_stub_attachment: FeatureOutcome::NotRequested,
        serial_transport_extension: FeatureOutcome::NotRequested,
        serial_ports: Vec::new(),
    };

    let mut enabled = Vec::new();
    for feature in settings.requested_features() {
        let availability = bridge.capabilities().availability(feature);
        match availability.reason() {
            None => enabled.push(feature),
            Some(reason) if settings.is_required(feature) => {
                return Err(Error::UnsupportedOperation {
                    feature,
                    reason: format!("required by settings, but {}", reason),
                });
            }
            Some(reason) => {
                warn!("{} unavailable, continuing without it: {}", feature, reason);
                *report.outcome_mut(feature) = FeatureOutcome::Skipped { reason };
            }
        }
    }

    let rom = match &settings.custom_rom {
        Some(rom) if enabled.contains(&Feature::BootRomOverride) => {
            let target = match (rom.path.as_ref(), framework.boot_loader(config)) {
                (None, _) => Err("custom_rom.path is not set".to_string()),
                (Some(_), None) => Err("the configuration has no boot loader".to_string()),
                (Some(_), Some(loader)) if !framework.accepts_rom_override(loader) => {
                    Err("the boot loader does not take a custom ROM".to_string())
                }
                (Some(location), Some(_)) => Ok(location),
            };
            match target {
                Ok(location) => {
                    location.ensure_readable()?;
                    Some(location)
                }
                Err(reason) if settings.is_required(Feature::BootRomOverride) => {
                    return Err(Error::InvalidArgument(format!(
                        "{} is required by settings, but {}",
                        Feature::BootRomOverride,
                        reason
                    )));
                }
                Err(reason) => {
                    warn!("skipping {}: {}", Feature::BootRomOverride, reason);
                    report.boot_rom_override = FeatureOutcome::Skipped { reason };
                    None
                }
            }
        }
        _ => None,
    };

    let stub = match &settings.debug_stub {
        Some(stub) if enabled.contains(&Feature::DebugStubAttachment) => {
            let port = u32::try_from(stub.port).map_err(|_| {
                Error::InvalidArgument(format!("debug stub port {} is negative", stub.port))
            })?;
            let descriptor = DebugStubDescriptor::new(port);
            descriptor.validated_port()?;
            if settings.reattach == ReattachPolicy::Reject
                && bridge.attached_debug_stub(config).is_some()
            {
                return Err(Error::AlreadyAttached(Feature::DebugStubAttachment));
            }
            Some(descriptor)
        }
        _ => None,
    };

    // Build every port object before touching the list.
    let mut ports = Vec::with_capacity(settings.serial_ports.len());
    for port in &settings.serial_ports {
        ports.push(match port.mode {
            SerialMode::Pl011 if enabled.contains(&Feature::SerialTransportExtension) => {
                Some(bridge.create_extended_serial_transport()?)
            }
            SerialMode::Pl011 => None,
            SerialMode::VirtioConsole => Some(framework.new_virtio_console_port()?),
        });
    }

    if let Some(location) = rom {
        let loader = framework.boot_loader_mut(config).ok_or_else(|| {
            Error::PreconditionViolated("configuration has no boot loader".into())
        })?;
        bridge.set_firmware_image_location(loader, location)?;
        report.boot_rom_override = FeatureOutcome::Applied;
    }

    if let Some(descriptor) = stub {
        bridge.attach_debug_stub_with_policy(config, &descriptor, settings.reattach)?;
        report.debug_stub_attachment = FeatureOutcome::Applied;
    }

    for port in ports {
        let index = match port {
            Some(port) => Some(framework.push_serial_port(config, port)?),
            None => None,
        };
        report.serial_ports.push(index);
    }
    if enabled.contains(&Feature::SerialTransportExtension) {
        report.serial_transport_extension = FeatureOutcome::Applied;
    }

    info!(
        "applied settings on framework {} (skipped: {:?})",
        report.framework_version,
        report.skipped()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::simulated::{ReleaseProfile, SimConfiguration, SimulatedFramework};
    use crate::firmware::FirmwareImageLocation;
    use crate::settings::{CustomRomSettings, DebugStubSettings, SerialPortSettings};

    fn settings_with_stub(port: i64) -> BridgeSettings {
        BridgeSettings {
            debug_stub: Some(DebugStubSettings {
                enabled: true,
                port,
            }),
            ..BridgeSettings::default()
        }
    }

    fn settings_with_rom(path: Option<&std::path::Path>) -> BridgeSettings {
        BridgeSettings {
            custom_rom: Some(CustomRomSettings {
                enabled: true,
                path: path.map(|p| FirmwareImageLocation::from_path(p).unwrap()),
            }),
            ..settings_with_stub(1234)
        }
    }

    #[test]
    fn empty_settings_change_nothing() {
        let framework = SimulatedFramework::profile(ReleaseProfile::Latest);
        let bridge = Bridge::new(&framework);
        let mut config = SimConfiguration::new();
        let before = config.clone();

        let report = apply_settings(&bridge, &mut config, &BridgeSettings::default()).unwrap();
        assert_eq!(config, before);
        assert!(report.skipped().is_empty());
        assert_eq!(report.outcome(Feature::DebugStubAttachment), &FeatureOutcome::NotRequested);
        assert_eq!(framework.private_invocations(), 0);
    }

    #[test]
    fn optional_feature_is_skipped_when_missing() {
        let framework = SimulatedFramework::profile(ReleaseProfile::MacOs11);
        let bridge = Bridge::new(&framework);
        let mut config = SimConfiguration::new();

        let report = apply_settings(&bridge, &mut config, &settings_with_stub(1234)).unwrap();
        assert_eq!(report.skipped(), vec![Feature::DebugStubAttachment]);
        assert_eq!(config.debug_stub_port(), None);
    }

    #[test]
    fn required_feature_fails_when_missing() {
        let framework = SimulatedFramework::profile(ReleaseProfile::MacOs11);
        let bridge = Bridge::new(&framework);
        let mut config = SimConfiguration::new();
        let mut settings = settings_with_stub(1234);
        settings.require.push(Feature::DebugStubAttachment);
        settings.serial_ports.push(SerialPortSettings {
            mode: SerialMode::VirtioConsole,
        });

        let err = apply_settings(&bridge, &mut config, &settings).unwrap_err();
        assert!(err.is_unsupported());
        assert!(config.serial_ports().is_empty());
    }

    #[test]
    fn reject_policy_conflict_is_detected_up_front() {
        let framework = SimulatedFramework::profile(ReleaseProfile::Latest);
        let bridge = Bridge::new(&framework);
        let mut config = SimConfiguration::new();
        bridge
            .attach_debug_stub(&mut config, &DebugStubDescriptor::new(1111))
            .unwrap();

        let mut settings = settings_with_stub(2222);
        settings.reattach = ReattachPolicy::Reject;
        settings.serial_ports.push(SerialPortSettings {
            mode: SerialMode::Pl011,
        });

        let err = apply_settings(&bridge, &mut config, &settings).unwrap_err();
        assert!(matches!(err, Error::AlreadyAttached(_)));
        assert_eq!(config.debug_stub_port(), Some(1111));
        assert!(config.serial_ports().is_empty());
    }

    #[test]
    fn consumed_configuration_is_refused() {
        let framework = SimulatedFramework::profile(ReleaseProfile::Latest);
        let bridge = Bridge::new(&framework);
        let mut config = SimConfiguration::new();
        config.set_boot_loader(framework.linux_boot_loader()).unwrap();
        framework.instantiate(&mut config).unwrap();

        let err = apply_settings(&bridge, &mut config, &settings_with_stub(1234)).unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
    }

    #[test]
    fn custom_rom_is_skipped_on_linux_boot_loader() {
        let rom = tempfile::NamedTempFile::new().unwrap();
        let framework = SimulatedFramework::profile(ReleaseProfile::Latest);
        let bridge = Bridge::new(&framework);
        let mut config = SimConfiguration::new();
        config.set_boot_loader(framework.linux_boot_loader()).unwrap();

        let report =
            apply_settings(&bridge, &mut config, &settings_with_rom(Some(rom.path()))).unwrap();
        assert_eq!(report.skipped(), vec![Feature::BootRomOverride]);
        assert_eq!(report.outcome(Feature::DebugStubAttachment), &FeatureOutcome::Applied);
        assert_eq!(config.debug_stub_port(), Some(1234));
        assert!(config.boot_loader().unwrap().stored_rom().is_none());
    }

    #[test]
    fn required_custom_rom_fails_on_linux_boot_loader() {
        let rom = tempfile::NamedTempFile::new().unwrap();
        let framework = SimulatedFramework::profile(ReleaseProfile::Latest);
        let bridge = Bridge::new(&framework);
        let mut config = SimConfiguration::new();
        config.set_boot_loader(framework.linux_boot_loader()).unwrap();
        let mut settings = settings_with_rom(Some(rom.path()));
        settings.require.push(Feature::BootRomOverride);

        let err = apply_settings(&bridge, &mut config, &settings).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(config.debug_stub_port(), None);
        assert_eq!(framework.private_invocations(), 0);
    }

    #[test]
    fn custom_rom_without_path_is_skipped() {
        let framework = SimulatedFramework::profile(ReleaseProfile::MacOs12);
        let bridge = Bridge::new(&framework);
        let mut config = SimConfiguration::new();
        config.set_boot_loader(framework.mac_os_boot_loader().unwrap()).unwrap();

        let report = apply_settings(&bridge, &mut config, &settings_with_rom(None)).unwrap();
        assert!(matches!(
            report.outcome(Feature::BootRomOverride),
            FeatureOutcome::Skipped { reason } if reason.contains("custom_rom.path")
        ));
        assert_eq!(config.debug_stub_port(), Some(1234));
    }

    #[test]
    fn skipped_serial_port_keeps_its_slot() {
        let framework = SimulatedFramework::profile(ReleaseProfile::MacOs12);
        let bridge = Bridge::new(&framework);
        let mut config = SimConfiguration::new();
        let settings = BridgeSettings {
            serial_ports: vec![
                SerialPortSettings {
                    mode: SerialMode::Pl011,
                },
                SerialPortSettings {
                    mode: SerialMode::VirtioConsole,
                },
            ],
            ..BridgeSettings::default()
        };

        let report = apply_settings(&bridge, &mut config, &settings).unwrap();
        assert_eq!(report.serial_ports, vec![None, Some(0)]);
        assert_eq!(config.serial_ports().len(), 1);
    }
}
