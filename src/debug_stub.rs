//! GDB remote debug stub descriptor.

use crate::{Error, Result};

/// Highest valid TCP listen port.
pub const MAX_LISTEN_PORT: u32 = u16::MAX as u32;

/// Port value asking the host OS to pick a free port.
pub const OS_ASSIGNED_PORT: u32 = 0;

/// Remote debugging endpoint to attach to a VM configuration.
///
/// A plain value: clones are independent, and attaching copies the port
/// into a fresh framework object, so changing a descriptor after it was
/// attached does not affect the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DebugStubDescriptor {
    listen_port: u32,
}

impl DebugStubDescriptor {
    /// Create a descriptor. The port is range-checked when attached.
    pub fn new(listen_port: u32) -> Self {
        Self { listen_port }
    }

    /// Descriptor with an OS-assigned port.
    pub fn os_assigned() -> Self {
        Self::new(OS_ASSIGNED_PORT)
    }

    pub fn listen_port(&self) -> u32 {
        self.listen_port
    }

    pub fn set_listen_port(&mut self, listen_port: u32) {
        self.listen_port = listen_port;
    }

    pub fn is_os_assigned(&self) -> bool {
        self.listen_port == OS_ASSIGNED_PORT
    }

    /// The port as a TCP port number, or `InvalidArgument` if out of range.
    pub fn validated_port(&self) -> Result<u16> {
        u16::try_from(self.listen_port).map_err(|_| {
            Error::InvalidArgument(format!(
                "debug stub port {} is outside 0-{}",
                self.listen_port, MAX_LISTEN_PORT
            ))
        })
    }
}

impl From<u16> for DebugStubDescriptor {
    fn from(port: u16) -> Self {
        Self::new(u32::from(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_is_independent() {
        let original = DebugStubDescriptor::new(12345);
        let mut copy = original.clone();
        assert_eq!(copy, original);
        copy.set_listen_port(9999);
        assert_eq!(original.listen_port(), 12345);
        assert_ne!(copy, original);
    }

    #[test]
    fn port_range_is_checked() {
        assert_eq!(DebugStubDescriptor::new(65535).validated_port().unwrap(), 65535);
        assert!(matches!(
            DebugStubDescriptor::new(70000).validated_port(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_means_os_assigned() {
        let d = DebugStubDescriptor::default();
        assert!(d.is_os_assigned());
        assert_eq!(d, DebugStubDescriptor::os_assigned());
        assert_eq!(d.validated_port().unwrap(), 0);
    }
}
