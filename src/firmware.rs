//! Firmware image locators for the boot ROM override.
//!
//! The framework only loads ROM images from local files, so a location is
//! either a `file://` URI or an absolute path. Syntax is checked on
//! construction; readability is a separate, blocking check made right
//! before the location is applied.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

const FILE_SCHEME: &str = "file://";

/// Location of a boot ROM image on the host filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirmwareImageLocation {
    path: PathBuf,
}

impl FirmwareImageLocation {
    /// Parse a `file://` URI or an absolute path.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidArgument(
                "firmware image location is empty".into(),
            ));
        }

        if let Some(rest) = strip_prefix_ignore_case(input, FILE_SCHEME) {
            let path = match rest.find('/') {
                Some(0) => rest,
                Some(idx) if rest[..idx].eq_ignore_ascii_case("localhost") => &rest[idx..],
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "firmware URI '{}' must name a local file",
                        input
                    )))
                }
            };
            return Self::from_path(percent_decode(path)?);
        }

        if has_scheme(input) {
            return Err(Error::InvalidArgument(format!(
                "unsupported firmware URI scheme in '{}': only file:// is accepted",
                input
            )));
        }

        Self::from_path(input)
    }

    /// Wrap an absolute filesystem path.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "firmware image path must be absolute: {}",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `file://` form with reserved bytes percent-encoded.
    pub fn to_uri(&self) -> String {
        let raw = self.path.to_string_lossy();
        let mut uri = String::with_capacity(FILE_SCHEME.len() + raw.len());
        uri.push_str(FILE_SCHEME);
        for byte in raw.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'/' | b'-' | b'.' | b'_' | b'~') {
                uri.push(byte as char);
            } else {
                uri.push_str(&format!("%{:02X}", byte));
            }
        }
        uri
    }

    /// Fail with `InvalidArgument` unless the location is a readable file.
    ///
    /// This opens the file, so it blocks on the filesystem.
    pub fn ensure_readable(&self) -> Result<()> {
        let file = File::open(&self.path).map_err(|e| {
            Error::InvalidArgument(format!(
                "firmware image {} is not readable: {}",
                self.path.display(),
                e
            ))
        })?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(Error::InvalidArgument(format!(
                "firmware image {} is not a regular file",
                self.path.display()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for FirmwareImageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

impl FromStr for FirmwareImageLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for FirmwareImageLocation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FirmwareImageLocation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let head = input.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &input[prefix.len()..])
}

/// `scheme:` per RFC 3986, appearing before any path separator.
fn has_scheme(input: &str) -> bool {
    let Some(colon) = input.find(':') else {
        return false;
    };
    let scheme = &input[..colon];
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("malformed percent escape in '{}'", input))
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| Error::InvalidArgument(format!("firmware URI '{}' is not UTF-8", input)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_absolute_path() {
        let loc = FirmwareImageLocation::parse("/opt/rom/AVPBooter.bin").unwrap();
        assert_eq!(loc.path(), Path::new("/opt/rom/AVPBooter.bin"));
    }

    #[test]
    fn parses_file_uri_with_escapes() {
        let loc = FirmwareImageLocation::parse("file:///Users/me/My%20ROMs/boot.rom").unwrap();
        assert_eq!(loc.path(), Path::new("/Users/me/My ROMs/boot.rom"));
        assert_eq!(loc.to_uri(), "file:///Users/me/My%20ROMs/boot.rom");
    }

    #[test]
    fn parses_localhost_authority() {
        let loc = FirmwareImageLocation::parse("FILE://localhost/tmp/rom.bin").unwrap();
        assert_eq!(loc.path(), Path::new("/tmp/rom.bin"));
    }

    #[test]
    fn rejects_remote_and_foreign_schemes() {
        for input in [
            "file://server/share/rom.bin",
            "https://example.com/rom.bin",
            "s3:bucket/rom.bin",
        ] {
            let err = FirmwareImageLocation::parse(input).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{}", input);
        }
    }

    #[test]
    fn rejects_relative_empty_and_bad_escapes() {
        assert!(FirmwareImageLocation::parse("roms/boot.bin").is_err());
        assert!(FirmwareImageLocation::parse("   ").is_err());
        assert!(FirmwareImageLocation::parse("file:///tmp/%zz").is_err());
        assert!(FirmwareImageLocation::parse("file:///tmp/%2").is_err());
    }

    #[test]
    fn readable_file_passes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x7fROM").unwrap();
        let loc = FirmwareImageLocation::from_path(file.path()).unwrap();
        loc.ensure_readable().unwrap();
    }

    #[test]
    fn missing_file_and_directory_fail() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FirmwareImageLocation::from_path(dir.path().join("nope.rom")).unwrap();
        assert!(matches!(
            missing.ensure_readable(),
            Err(Error::InvalidArgument(_))
        ));
        let directory = FirmwareImageLocation::from_path(dir.path()).unwrap();
        assert!(matches!(
            directory.ensure_readable(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn serde_accepts_path_or_uri() {
        let from_path: FirmwareImageLocation = serde_json::from_str("\"/tmp/a b.rom\"").unwrap();
        let from_uri: FirmwareImageLocation =
            serde_json::from_str("\"file:///tmp/a%20b.rom\"").unwrap();
        assert_eq!(from_path, from_uri);
        assert_eq!(
            serde_json::to_string(&from_path).unwrap(),
            "\"file:///tmp/a%20b.rom\""
        );
    }
}
