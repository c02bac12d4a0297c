//! Session identity and device role types.

use core::fmt;

use strum::{Display as StrumDisplay, EnumString};

/// Opaque 16-byte session identifier.
///
/// Displayed hyphenated (8-4-4-4-12 hex groups) wherever a session id is
/// surfaced to a human or to the cloud-visible status resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    pub const ZERO: SessionId = SessionId([0u8; 16]);

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl From<[u8; 16]> for SessionId {
    fn from(bytes: [u8; 16]) -> Self {
        SessionId(bytes)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3],
            b[4], b[5],
            b[6], b[7],
            b[8], b[9],
            b[10], b[11], b[12], b[13], b[14], b[15],
        )
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

/// Which role a device plays for a given session.
///
/// A session only ever applies to a device whose `DeviceType` matches the
/// one carried in the `START`/`ACTIVATE` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
pub enum DeviceType {
    #[strum(serialize = "border-router")]
    BorderRouter,
    #[strum(serialize = "node")]
    Node,
}

impl DeviceType {
    pub fn to_wire(self) -> u8 {
        match self {
            DeviceType::BorderRouter => 0,
            DeviceType::Node => 1,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(DeviceType::BorderRouter),
            1 => Some(DeviceType::Node),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::format;

    #[test]
    fn session_id_display_is_hyphenated() {
        let id = SessionId([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ]);
        assert_eq!(format!("{}", id), "01020304-0506-0708-090a-0b0c0d0e0f10");
    }

    #[test]
    fn zero_session_id_is_all_zero_hex() {
        assert_eq!(
            format!("{}", SessionId::ZERO),
            "00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn device_type_wire_round_trip() {
        assert_eq!(DeviceType::from_wire(DeviceType::BorderRouter.to_wire()), Some(DeviceType::BorderRouter));
        assert_eq!(DeviceType::from_wire(DeviceType::Node.to_wire()), Some(DeviceType::Node));
        assert_eq!(DeviceType::from_wire(2), None);
    }
}
