use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::bridge::ReattachPolicy;
use crate::debug_stub::MAX_LISTEN_PORT;
use crate::feature::Feature;
use crate::firmware::FirmwareImageLocation;
use crate::{Error, Result};

/// Default GDB stub port when a settings file enables debugging without one.
pub const DEFAULT_DEBUG_PORT: i64 = 10086;

/// Host-side request for the private features of one VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub debug_stub: Option<DebugStubSettings>,
    #[serde(default)]
    pub custom_rom: Option<CustomRomSettings>,
    /// Serial ports appended to the configuration, in order.
    #[serde(default)]
    pub serial_ports: Vec<SerialPortSettings>,
    /// Features whose absence is an error instead of a skipped step.
    #[serde(default)]
    pub require: Vec<Feature>,
    #[serde(default)]
    pub reattach: ReattachPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugStubSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Signed so that bad values survive parsing and get a precise error.
    #[serde(default = "default_debug_port")]
    pub port: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRomSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<FirmwareImageLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortSettings {
    pub mode: SerialMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialMode {
    /// Private PL011 UART.
    Pl011,
    /// Public virtio console.
    VirtioConsole,
}

/// Encoding of a settings document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsFormat {
    Json,
    Yaml,
}

impl SettingsFormat {
    /// YAML for `.yaml`/`.yml`, JSON otherwise.
    pub fn from_path(path: &Path) -> Self {
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if is_yaml {
            SettingsFormat::Yaml
        } else {
            SettingsFormat::Json
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_debug_port() -> i64 {
    DEFAULT_DEBUG_PORT
}

impl BridgeSettings {
    /// Features these settings ask for.
    pub fn requested_features(&self) -> BTreeSet<Feature> {
        let mut features = BTreeSet::new();
        if self.custom_rom.as_ref().is_some_and(|rom| rom.enabled) {
            features.insert(Feature::BootRomOverride);
        }
        if self.debug_stub.as_ref().is_some_and(|stub| stub.enabled) {
            features.insert(Feature::DebugStubAttachment);
        }
        if self
            .serial_ports
            .iter()
            .any(|port| port.mode == SerialMode::Pl011)
        {
            features.insert(Feature::SerialTransportExtension);
        }
        features
    }

    pub fn is_required(&self, feature: Feature) -> bool {
        self.require.contains(&feature)
    }
}

pub fn load_settings(path: &Path) -> Result<BridgeSettings> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_settings(&raw, SettingsFormat::from_path(path)).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

pub fn parse_settings(raw: &str, format: SettingsFormat) -> Result<BridgeSettings> {
    let settings: BridgeSettings = match format {
        SettingsFormat::Yaml => serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid YAML settings: {}", e)))?,
        SettingsFormat::Json => serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid JSON settings: {}", e)))?,
    };

    validate_settings(&settings)?;
    Ok(settings)
}

pub fn validate_settings(settings: &BridgeSettings) -> Result<()> {
    if let Some(stub) = &settings.debug_stub {
        if stub.enabled && !(0..=i64::from(MAX_LISTEN_PORT)).contains(&stub.port) {
            return Err(Error::Config(format!(
                "debug_stub.port {} is outside 0-{}",
                stub.port, MAX_LISTEN_PORT
            )));
        }
    }

    if let Some(rom) = &settings.custom_rom {
        if rom.enabled && rom.path.is_none() && settings.is_required(Feature::BootRomOverride) {
            return Err(Error::Config(
                "boot_rom_override is required but custom_rom.path is not set".into(),
            ));
        }
    }

    let requested = settings.requested_features();
    for feature in &settings.require {
        if !requested.contains(feature) {
            return Err(Error::Config(format!(
                "'{}' is listed in require but not enabled",
                feature.id()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let settings = parse_settings("{}", SettingsFormat::Json).unwrap();
        assert_eq!(settings, BridgeSettings::default());
        assert!(settings.requested_features().is_empty());
    }

    #[test]
    fn yaml_with_defaults() {
        let raw = r#"
debug_stub: {}
custom_rom:
  path: /opt/roms/AVPBooter.vmapple2.bin
serial_ports:
  - mode: pl011
  - mode: virtio_console
require: [debug_stub_attachment]
"#;
        let settings = parse_settings(raw, SettingsFormat::Yaml).unwrap();
        let stub = settings.debug_stub.as_ref().unwrap();
        assert!(stub.enabled);
        assert_eq!(stub.port, DEFAULT_DEBUG_PORT);
        assert_eq!(settings.reattach, ReattachPolicy::Replace);
        assert_eq!(
            settings.requested_features().into_iter().collect::<Vec<_>>(),
            Feature::ALL.to_vec()
        );
        assert!(settings.is_required(Feature::DebugStubAttachment));
        assert!(!settings.is_required(Feature::BootRomOverride));
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let err = parse_settings(r#"{"debug_stub": {"port": 70000}}"#, SettingsFormat::Json)
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("70000")));
        assert!(
            parse_settings(r#"{"debug_stub": {"port": -1}}"#, SettingsFormat::Json).is_err()
        );
    }

    #[test]
    fn disabled_stub_port_is_not_checked() {
        let settings = parse_settings(
            r#"{"debug_stub": {"enabled": false, "port": 70000}}"#,
            SettingsFormat::Json,
        )
        .unwrap();
        assert!(settings.requested_features().is_empty());
    }

    #[test]
    fn rom_without_path_is_accepted_unless_required() {
        let settings = parse_settings("custom_rom: {}", SettingsFormat::Yaml).unwrap();
        assert!(settings.requested_features().contains(&Feature::BootRomOverride));

        let err = parse_settings(
            "custom_rom: {}\nrequire: [boot_rom_override]",
            SettingsFormat::Yaml,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("custom_rom.path")));
    }

    #[test]
    fn relative_rom_path_is_rejected_while_parsing() {
        let err = parse_settings("custom_rom: {path: roms/a.bin}", SettingsFormat::Yaml)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn require_must_name_a_requested_feature() {
        let err = parse_settings(
            r#"{"require": ["serial_transport_extension"]}"#,
            SettingsFormat::Json,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("serial_transport_extension")));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(SettingsFormat::from_path(Path::new("vm.YML")), SettingsFormat::Yaml);
        assert_eq!(SettingsFormat::from_path(Path::new("vm.json")), SettingsFormat::Json);
        assert_eq!(SettingsFormat::from_path(Path::new("vm")), SettingsFormat::Json);
    }

    #[test]
    fn load_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "serial_ports: [{mode: rs232}]").unwrap();
        let err = load_settings(&path).unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }
}
