//! The persisted session record (§3) and the state tag (§4.5).

use alloc::vec::Vec;

use strum::Display as StrumDisplay;

use crate::bitmask::{segment_count_for, Bitmask};
use crate::codec::Command;
use crate::ids::{DeviceType, SessionId};

/// Current position in the dispatcher's state machine.
///
/// Deliberately a plain unit-variant tag rather than a variant carrying
/// the checksum cursor/context or serve-loop scratch (see SPEC_FULL.md
/// §3, §9): those are engine-local and non-persisted, while `OtaState` is
/// exactly the piece of session data that must round-trip through
/// `store_session`/`load_session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
pub enum OtaState {
    #[strum(serialize = "IDLE")]
    Idle,
    #[strum(serialize = "STARTED")]
    Started,
    #[strum(serialize = "MANIFEST RECEIVED")]
    ManifestReceived,
    #[strum(serialize = "MISSING FRAGMENTS REQUESTING")]
    MissingFragmentsRequesting,
    #[strum(serialize = "CHECKSUM CALCULATING")]
    ChecksumCalculating,
    #[strum(serialize = "CHECKSUM FAILED")]
    ChecksumFailed,
    #[strum(serialize = "FIRMWARE DOWNLOADED")]
    ProcessCompleted,
    #[strum(serialize = "ACTIVATE FIRMWARE")]
    UpdateFw,
    #[strum(serialize = "ABORTED")]
    Aborted,
    #[strum(serialize = "INVALID")]
    Invalid,
}

impl OtaState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OtaState::ProcessCompleted
                | OtaState::UpdateFw
                | OtaState::ChecksumFailed
                | OtaState::Aborted
        )
    }
}

/// The durable unit of a single firmware distribution. At most one
/// exists at a time (§3 invariant); creating a second must fail.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParameters {
    pub session_id: SessionId,
    pub device_type: DeviceType,
    pub fw_total_byte_count: u32,
    pub fw_fragment_byte_count: u16,
    pub fw_fragment_count: u16,
    pub fw_segment_count: u16,
    pub whole_fw_checksum: [u8; 32],
    pub fragments_bitmask: Bitmask,
    pub pull_url: Option<Vec<u8>>,
    pub ota_state: OtaState,
}

impl SessionParameters {
    /// Builds a fresh session for a node receiving a `START` command.
    /// `fragment_count` is taken as transmitted on the wire (not
    /// recomputed from `total_size`/`fragment_size`); `segment_count` is
    /// always recomputed locally by ceiling division, never trusted off
    /// the wire (there is no such field on the wire anyway) and never
    /// truncated.
    pub fn new_from_start(session_id: SessionId, device_type: DeviceType, cmd: &StartFields) -> Self {
        let segment_count = segment_count_for(cmd.frag_count);
        SessionParameters {
            session_id,
            device_type,
            fw_total_byte_count: cmd.total_size,
            fw_fragment_byte_count: cmd.frag_size,
            fw_fragment_count: cmd.frag_count,
            fw_segment_count: segment_count,
            whole_fw_checksum: cmd.hash,
            fragments_bitmask: Bitmask::new(cmd.frag_count),
            pull_url: None,
            ota_state: OtaState::Started,
        }
    }

    /// Builds a fresh session for a router announcing a session from a
    /// locally-triggered `FIRMWARE` command: `fragment_count` is computed
    /// here (ceiling division), not received.
    pub fn new_for_router(
        session_id: SessionId,
        total_size: u32,
        fragment_size: u16,
        hash: [u8; 32],
        pull_url: Option<Vec<u8>>,
    ) -> Self {
        let frag_count = if fragment_size == 0 {
            0
        } else {
            let q = total_size / fragment_size as u32;
            if total_size % fragment_size as u32 != 0 {
                (q + 1) as u16
            } else {
                q as u16
            }
        };
        let segment_count = segment_count_for(frag_count);
        SessionParameters {
            session_id,
            device_type: DeviceType::BorderRouter,
            fw_total_byte_count: total_size,
            fw_fragment_byte_count: fragment_size,
            fw_fragment_count: frag_count,
            fw_segment_count: segment_count,
            whole_fw_checksum: hash,
            fragments_bitmask: Bitmask::new(frag_count),
            pull_url,
            ota_state: OtaState::Started,
        }
    }

    pub fn missing_total(&self) -> u16 {
        self.fragments_bitmask.missing_total()
    }
}

/// The fields of a decoded `START` command, used to build a
/// [`SessionParameters`] without coupling `session.rs` to the full
/// `codec::Command` enum shape at every call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartFields {
    pub frag_count: u16,
    pub frag_size: u16,
    pub total_size: u32,
    pub hash: [u8; 32],
}

impl StartFields {
    pub fn from_command(command: &Command) -> Option<StartFields> {
        match command {
            Command::Start {
                frag_count,
                frag_size,
                total_size,
                hash,
                ..
            } => Some(StartFields {
                frag_count: *frag_count,
                frag_size: *frag_size,
                total_size: *total_size,
                hash: *hash,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::format;

    #[test]
    fn state_display_matches_status_names() {
        assert_eq!(format!("{}", OtaState::Idle), "IDLE");
        assert_eq!(format!("{}", OtaState::MissingFragmentsRequesting), "MISSING FRAGMENTS REQUESTING");
        assert_eq!(format!("{}", OtaState::ProcessCompleted), "FIRMWARE DOWNLOADED");
        assert_eq!(format!("{}", OtaState::UpdateFw), "ACTIVATE FIRMWARE");
        assert_eq!(format!("{}", OtaState::ChecksumFailed), "CHECKSUM FAILED");
    }

    #[test]
    fn new_from_start_recomputes_segment_count() {
        let session = SessionParameters::new_from_start(
            SessionId::ZERO,
            DeviceType::Node,
            &StartFields {
                frag_count: 129,
                frag_size: 1024,
                total_size: 129 * 1024,
                hash: [0u8; 32],
            },
        );
        assert_eq!(session.fw_segment_count, 2);
    }

    #[test]
    fn router_session_computes_fragment_count_by_ceiling_division() {
        let session = SessionParameters::new_for_router(SessionId::ZERO, 2048, 1024, [0u8; 32], None);
        assert_eq!(session.fw_fragment_count, 2);
        let session2 = SessionParameters::new_for_router(SessionId::ZERO, 2049, 1024, [0u8; 32], None);
        assert_eq!(session2.fw_fragment_count, 3);
    }
}
