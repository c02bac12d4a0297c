//! Router-role handlers (§4.5 "Router role adds").
//!
//! A border router's own session passes through the *same* dispatcher
//! as a node's (`dispatch_frame`/`dispatch_timer` in [`super::node`]) —
//! the only router-specific entry points are the three local triggers
//! a border router's side-channel CoAP resources surface: a firmware
//! push request, a manifest relay request, and an activate-fleet
//! request. Everything downstream of a `FIRMWARE` trigger (START
//! announce, per-fragment cadence, END_FRAGMENTS) reuses the node-role
//! command handlers once the router has multicast them, since the
//! router also tracks its own push in a `SessionParameters` record —
//! grounded on `libota.c`'s border-router path reusing
//! `ota_manage_fragment_command`'s bitmask bookkeeping for its own
//! announce loop rather than keeping a second, router-only record.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::codec::{fragment_crc16, Command, Frame};
use crate::collab::Collaborators;
use crate::error::OtaError;
use crate::ids::{DeviceType, SessionId};
use crate::session::SessionParameters;
use crate::timer::TimerId;

use super::Engine;

/// A locally-triggered firmware push request (the border-router-side
/// `FIRMWARE` command of §4.1, which never crosses the socket codec —
/// it only ever arrives from the local resource side-channel).
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareTrigger {
    pub total_size: u32,
    /// Zero selects [`super::EngineConfig::default_fragment_byte_count`].
    pub fragment_size: u16,
    pub hash: [u8; 32],
    pub pull_url: Option<Vec<u8>>,
}

impl<C: Collaborators> Engine<C> {
    /// Entry point for the border router's `FIRMWARE` resource trigger:
    /// allocates a session for the image already sitting in local
    /// storage and verifies its checksum before announcing anything
    /// (§4.5, §9 "the source computes the checksum of its own image
    /// before distributing it").
    pub fn handle_firmware_trigger(&mut self, trigger: FirmwareTrigger) -> Result<(), OtaError> {
        if self.own_device_type != DeviceType::BorderRouter {
            warn!("FIRMWARE trigger ignored: device is not a border router");
            return Ok(());
        }
        if self.session.is_some() {
            warn!("FIRMWARE trigger received while a session is already active — rejected");
            self.report_error(OtaError::ParameterFail);
            return Err(OtaError::ParameterFail);
        }

        let fragment_size = if trigger.fragment_size == 0 {
            self.config.default_fragment_byte_count
        } else {
            trigger.fragment_size
        };

        let session_id = self.generate_session_id();
        self.collab.store_new_process(session_id).map_err(|e| {
            warn!("store_new_process failed: {:?}", e);
            OtaError::StorageError
        })?;

        let mut session =
            SessionParameters::new_for_router(session_id, trigger.total_size, fragment_size, trigger.hash, trigger.pull_url);
        // The router already holds the complete image (out of scope: how
        // it got there — a prior pull, flash image, etc.); fast-forward
        // the bitmask to fully received so the shared checksum pipeline
        // verifies the declared hash before anything is announced.
        for f in 1..=session.fw_fragment_count {
            session.fragments_bitmask.mark_received(f);
        }

        self.reset_session_scratch();
        self.collab.start_received(&session);
        self.session = Some(session);
        self.persist();
        self.publish_status();
        self.publish_ready();
        debug!("session {} -> STARTED, verifying own image before announce", session_id);
        self.enter_checksum_calculating();
        Ok(())
    }

    fn generate_session_id(&mut self) -> SessionId {
        let mut bytes = [0u8; 16];
        for chunk in bytes.chunks_mut(4) {
            chunk.copy_from_slice(&self.collab.rand32().to_be_bytes());
        }
        SessionId(bytes)
    }

    /// Called once the router's own checksum verification succeeds
    /// (`on_checksum_verified` in `node.rs`): multicasts `START` and
    /// arms the fixed-cadence delivery timer.
    pub(crate) fn handle_firmware_trigger_from_self(&mut self, session: &SessionParameters) -> Result<(), OtaError> {
        let frame = Frame {
            session_id: session.session_id,
            command: Command::Start {
                device_type: DeviceType::Node,
                frag_count: session.fw_fragment_count,
                frag_size: session.fw_fragment_byte_count,
                total_size: session.fw_total_byte_count,
                hash: session.whole_fw_checksum,
            },
        };
        if let Err(e) = self.collab.send_mpl_multicast(&frame.encode()) {
            warn!("send_mpl_multicast (START) failed: {:?}", e);
        }
        self.fw_delivering = true;
        self.next_deliver_fragment = 1;
        self.arm_fragments_delivering();
        Ok(())
    }

    fn arm_fragments_delivering(&mut self) {
        self.arm_ms(TimerId::FragmentsDelivering, self.config.multicast_interval_s * 1000);
    }

    pub(crate) fn fragments_delivering_timer_expired(&mut self) -> Result<(), OtaError> {
        if !self.fw_delivering {
            return Ok(());
        }
        let Some(session) = self.session.clone() else {
            self.fw_delivering = false;
            return Ok(());
        };

        let frag_id = self.next_deliver_fragment;
        if frag_id > session.fw_fragment_count {
            self.finish_delivering();
            return Ok(());
        }

        match self.read_fragment(&session, frag_id)? {
            Some(data) => {
                let crc = fragment_crc16(&data);
                let frame = Frame {
                    session_id: session.session_id,
                    command: Command::Fragment { frag_id, data, crc },
                };
                if let Err(e) = self.collab.send_mpl_multicast(&frame.encode()) {
                    warn!("send_mpl_multicast (FRAGMENT {}) failed: {:?}", frag_id, e);
                }
                self.next_deliver_fragment += 1;
                if self.next_deliver_fragment > session.fw_fragment_count {
                    self.finish_delivering();
                } else {
                    self.arm_fragments_delivering();
                }
            }
            None => {
                warn!("short read delivering fragment {} — retrying next cadence", frag_id);
                self.arm_fragments_delivering();
            }
        }
        Ok(())
    }

    fn finish_delivering(&mut self) {
        debug!("initial fragment push complete, arming END_FRAGMENTS");
        self.fw_delivering = false;
        self.arm_notification(TimerId::EndFragments);
    }

    /// Entry point for the border router's `MANIFEST` resource trigger:
    /// relays the manifest bytes as-is onto the MPL multicast group
    /// (§1 non-goal: manifest parsing beyond pass-through).
    pub fn handle_manifest_trigger(&mut self, data: Vec<u8>) -> Result<(), OtaError> {
        let session_id = self.session.as_ref().map(|s| s.session_id).unwrap_or(SessionId::ZERO);
        let frame = Frame {
            session_id,
            command: Command::Manifest { data },
        };
        if let Err(e) = self.collab.send_mpl_multicast(&frame.encode()) {
            warn!("send_mpl_multicast (MANIFEST relay) failed: {:?}", e);
        }
        Ok(())
    }

    /// Entry point for the border router's `ACTIVATE` resource trigger:
    /// relays the command onto the multicast group, then loops it back
    /// through the shared dispatcher so the router's own bookkeeping
    /// (`process_finished` once the target device type is a node) runs
    /// exactly as it would for any other peer observing its own relay.
    /// The single-session slot is freed once `MULTICAST_MESSAGE_SENT`
    /// debounces (`multicast_message_sent_timer_expired` in `node.rs`),
    /// giving the relay send a moment to actually leave before the
    /// session record disappears.
    pub fn handle_activate_trigger(&mut self, device_type: DeviceType, delay_seconds: u32) -> Result<(), OtaError> {
        let Some(session) = self.session.clone() else {
            warn!("ACTIVATE trigger with no active session — ignored");
            return Ok(());
        };
        let frame = Frame {
            session_id: session.session_id,
            command: Command::Activate { device_type, delay_seconds },
        };
        if let Err(e) = self.collab.send_mpl_multicast(&frame.encode()) {
            warn!("send_mpl_multicast (ACTIVATE relay) failed: {:?}", e);
        }
        self.dispatch_frame(frame)?;
        self.relay_session_id = Some(session.session_id);
        self.arm_notification(TimerId::MulticastMessageSent);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ids::DeviceType;
    use crate::session::OtaState;
    use crate::testutil::{fake_digest, MockCollaborators};

    use crate::engine::{Engine, EngineConfig};

    fn router_engine() -> Engine<MockCollaborators> {
        let collab = MockCollaborators::new();
        Engine::new(collab, DeviceType::BorderRouter, EngineConfig::default()).unwrap()
    }

    #[test]
    fn firmware_trigger_verifies_then_announces() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let mut engine = router_engine();
        let image: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let hash = fake_digest(&image);
        let session_id = {
            // seed the firmware bytes under the session id the engine is
            // about to generate (rand32 sequence of zeros -> all-zero id)
            crate::ids::SessionId([0u8; 16])
        };
        engine.collab.seed_firmware(session_id, image);

        engine
            .handle_firmware_trigger(FirmwareTrigger {
                total_size: 2048,
                fragment_size: 1024,
                hash,
                pull_url: None,
            })
            .unwrap();
        assert_eq!(engine.session().unwrap().ota_state, OtaState::ChecksumCalculating);

        // 2048 bytes / 512-byte slices -> 4 ticks to verify
        for _ in 0..4 {
            engine.handle_timer(TimerId::ChecksumCalculating).unwrap();
        }

        assert_eq!(engine.session().unwrap().ota_state, OtaState::ProcessCompleted);
        assert_eq!(engine.collab.sent.len(), 1);

        // drain the fixed-cadence delivery
        for _ in 0..2 {
            engine.handle_timer(TimerId::FragmentsDelivering).unwrap();
        }
        assert_eq!(engine.collab.sent.len(), 3); // START + 2 fragments
        assert!(!engine.fw_delivering);
    }

    #[test]
    fn firmware_trigger_rejected_on_node() {
        let collab = MockCollaborators::new();
        let mut engine = Engine::new(collab, DeviceType::Node, EngineConfig::default()).unwrap();
        engine
            .handle_firmware_trigger(FirmwareTrigger {
                total_size: 1024,
                fragment_size: 1024,
                hash: [0u8; 32],
                pull_url: None,
            })
            .unwrap();
        assert!(engine.session().is_none());
    }

    #[test]
    fn activate_trigger_relays_and_frees_session_after_debounce() {
        let mut engine = router_engine();
        let image = alloc::vec![0u8; 1024];
        let hash = fake_digest(&image);
        engine.collab.seed_firmware(crate::ids::SessionId([0u8; 16]), image);
        engine
            .handle_firmware_trigger(FirmwareTrigger {
                total_size: 1024,
                fragment_size: 1024,
                hash,
                pull_url: None,
            })
            .unwrap();
        for _ in 0..2 {
            engine.handle_timer(TimerId::ChecksumCalculating).unwrap();
        }
        engine.handle_timer(TimerId::FragmentsDelivering).unwrap();

        engine.handle_activate_trigger(DeviceType::Node, 10).unwrap();
        assert_eq!(engine.collab.notify.process_finished, 1);
        assert!(engine.session().is_some());

        engine.handle_timer(TimerId::MulticastMessageSent).unwrap();
        assert!(engine.session().is_none());
    }
}
