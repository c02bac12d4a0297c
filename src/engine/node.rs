//! Node-role command and timer handlers (§4.5), plus the top-level
//! [`dispatch_frame`](Engine::dispatch_frame)/[`dispatch_timer`](Engine::dispatch_timer)
//! routers shared by both roles — a border router loops its own
//! multicasts back through the same dispatch table (`libota.c`'s
//! `ota_manage_update_fw_command` and the `OTA_END_FRAGMENTS_TIMER`
//! case in `ota_timer_expired` both run unconditionally regardless of
//! `device_type`), so splitting dispatch itself by role would just
//! duplicate the match arms.

use alloc::vec::Vec;

use log::{debug, trace, warn};

use crate::bitmask::SegmentRequestMask;
use crate::codec::{fragment_crc16, Command, Frame};
use crate::collab::Collaborators;
use crate::error::OtaError;
use crate::hasher::HasherStep;
use crate::ids::DeviceType;
use crate::session::{OtaState, SessionParameters, StartFields};
use crate::timer::TimerId;

use super::Engine;

impl<C: Collaborators> Engine<C> {
    pub(crate) fn dispatch_frame(&mut self, frame: Frame) -> Result<(), OtaError> {
        match &frame.command {
            Command::Start { .. } => self.handle_start(frame),
            Command::Fragment { .. } => self.handle_fragment(frame),
            Command::EndFragments => self.handle_end_fragments(frame),
            Command::FragmentsRequest { .. } => self.handle_fragments_request(frame),
            Command::Abort => self.handle_abort(frame),
            Command::Activate { .. } => self.handle_activate(frame),
            Command::Manifest { .. } => self.handle_manifest(frame),
        }
    }

    pub(crate) fn dispatch_timer(&mut self, id: TimerId) -> Result<(), OtaError> {
        match id {
            TimerId::Activate => self.activate_timer_expired(),
            TimerId::EndFragments => self.end_fragments_timer_expired(),
            TimerId::MissingFragmentsRequesting => self.missing_fragments_requesting_timer_expired(),
            TimerId::FragmentsDelivering => self.fragments_delivering_timer_expired(),
            TimerId::FragmentsRequestService => self.fragments_request_service_timer_expired(),
            TimerId::Fallback => self.fallback_timer_expired(),
            TimerId::ChecksumCalculating => self.checksum_calculating_timer_expired(),
            TimerId::MulticastMessageSent => self.multicast_message_sent_timer_expired(),
            TimerId::FirmwareReady => self.firmware_ready_timer_expired(),
        }
    }

    // -- START --

    fn handle_start(&mut self, frame: Frame) -> Result<(), OtaError> {
        let fields = match StartFields::from_command(&frame.command) {
            Some(f) => f,
            None => return Ok(()),
        };
        let device_type = match &frame.command {
            Command::Start { device_type, .. } => *device_type,
            _ => unreachable!(),
        };

        if device_type != self.own_device_type {
            debug!("START for device type {:?}, we are {:?} — ignored", device_type, self.own_device_type);
            return Ok(());
        }

        if self.session.is_some() {
            warn!("START received while a session is already active — rejected");
            self.report_error(OtaError::ParameterFail);
            return Err(OtaError::ParameterFail);
        }

        self.collab.store_new_process(frame.session_id).map_err(|e| {
            warn!("store_new_process failed: {:?}", e);
            OtaError::StorageError
        })?;

        let session = SessionParameters::new_from_start(frame.session_id, device_type, &fields);
        self.reset_session_scratch();
        self.collab.start_received(&session);
        self.session = Some(session);
        self.arm_fallback();
        self.persist();
        self.publish_status();
        self.publish_ready();
        debug!("session {} -> STARTED ({} fragments)", frame.session_id, fields.frag_count);
        Ok(())
    }

    // -- FRAGMENT --

    fn handle_fragment(&mut self, frame: Frame) -> Result<(), OtaError> {
        let (frag_id, data, crc) = match frame.command {
            Command::Fragment { frag_id, data, crc } => (frag_id, data, crc),
            _ => return Ok(()),
        };
        if !self.matching_session(frame.session_id) {
            return Ok(());
        }

        if frag_id == 0 {
            warn!("fragment id 0 received — dropped");
            self.report_error(OtaError::ParameterFail);
            return Ok(());
        }

        let fragment_count = self.session.as_ref().map(|s| s.fw_fragment_count).unwrap_or(0);
        if frag_id > fragment_count {
            warn!("fragment id {} exceeds fragment count {} — dropped", frag_id, fragment_count);
            self.report_error(OtaError::ParameterFail);
            return Ok(());
        }

        let calculated = fragment_crc16(&data);
        if calculated != crc {
            warn!("fragment {} CRC mismatch (wire {:04x} calc {:04x}) — dropped", frag_id, crc, calculated);
            return Ok(());
        }

        // A serve loop in progress snoops fragments it sees on the wire (its
        // own, or another peer's) to avoid re-sending ones already delivered
        // by someone else for the segment it is serving.
        if self.fragments_request_service_active {
            self.observe_served_fragment(frag_id);
            return Ok(());
        }

        let state = self.session.as_ref().map(|s| s.ota_state);
        let accepting = matches!(
            state,
            Some(OtaState::Started) | Some(OtaState::MissingFragmentsRequesting)
        );
        if !accepting {
            trace!("fragment {} received in state {:?} — dropped", frag_id, state);
            return Ok(());
        }

        self.store_fragment(frag_id, &data)?;

        if let Some(session) = self.session.as_ref() {
            if session.ota_state == OtaState::MissingFragmentsRequesting && session.missing_total() > 0 {
                self.arm_missing_fragments_requesting();
            }
        }

        self.publish_status();
        Ok(())
    }

    fn store_fragment(&mut self, frag_id: u16, data: &[u8]) -> Result<(), OtaError> {
        let Some(session) = self.session.as_mut() else { return Ok(()) };
        if session.fragments_bitmask.is_received(frag_id) {
            return Ok(());
        }

        let offset = (frag_id as u32 - 1) * session.fw_fragment_byte_count as u32;
        let session_id = session.session_id;
        let written = self
            .collab
            .write_fw(session_id, offset, data)
            .map_err(|e| {
                warn!("write_fw failed: {:?}", e);
                OtaError::StorageError
            })?;

        if written as usize != data.len() {
            warn!("short write storing fragment {}: {} of {} bytes", frag_id, written, data.len());
            return Ok(());
        }

        let session = self.session.as_mut().expect("checked above");
        session.fragments_bitmask.mark_received(frag_id);
        self.persist();

        let missing = self.session.as_ref().unwrap().missing_total();
        debug!("fragment {} stored, {} missing", frag_id, missing);

        if missing == 0 {
            self.enter_checksum_calculating();
        } else {
            self.arm_fallback();
        }
        Ok(())
    }

    pub(crate) fn enter_checksum_calculating(&mut self) {
        let total = match self.session.as_ref() {
            Some(s) => s.fw_total_byte_count,
            None => return,
        };
        self.set_state(OtaState::ChecksumCalculating);
        let slice_bytes = self.config.checksum_calculating_byte_count;
        self.hasher = Some(crate::hasher::HasherPipeline::start_with_slice(self.collab.new_hasher(), total, slice_bytes));
        self.arm_checksum_timer();
    }

    // -- END_FRAGMENTS --

    fn handle_end_fragments(&mut self, frame: Frame) -> Result<(), OtaError> {
        if !self.matching_session(frame.session_id) {
            return Ok(());
        }
        let Some(session) = self.session.as_ref() else { return Ok(()) };
        if session.ota_state != OtaState::Started {
            return Ok(());
        }
        let missing = session.missing_total();
        debug!("END_FRAGMENTS received, {} missing", missing);
        if missing > 0 {
            self.set_state(OtaState::MissingFragmentsRequesting);
            self.arm_missing_fragments_requesting();
        }
        Ok(())
    }

    // -- ABORT --

    fn handle_abort(&mut self, frame: Frame) -> Result<(), OtaError> {
        if !self.matching_session(frame.session_id) {
            return Ok(());
        }
        self.abort()
    }

    // -- ACTIVATE --

    fn handle_activate(&mut self, frame: Frame) -> Result<(), OtaError> {
        let (device_type, delay_seconds) = match frame.command {
            Command::Activate { device_type, delay_seconds } => (device_type, delay_seconds),
            _ => return Ok(()),
        };
        if !self.matching_session(frame.session_id) {
            return Ok(());
        }

        self.cancel(TimerId::MissingFragmentsRequesting);
        self.cancel(TimerId::Fallback);

        let state = self.session.as_ref().map(|s| s.ota_state);
        if !matches!(state, Some(OtaState::ProcessCompleted) | Some(OtaState::UpdateFw)) {
            warn!("ACTIVATE received outside PROCESS_COMPLETED/UPDATE_FW (state {:?}) — ignored", state);
            return Ok(());
        }

        if device_type != self.own_device_type {
            if self.own_device_type == DeviceType::BorderRouter {
                self.collab.process_finished(frame.session_id);
            }
            return Ok(());
        }

        if !self.fw_update_received {
            self.activate_delay = Some(delay_seconds);
            self.arm_notification(TimerId::Activate);
            self.fw_update_received = true;
        }

        if state != Some(OtaState::UpdateFw) {
            self.set_state(OtaState::UpdateFw);
        }
        Ok(())
    }

    fn activate_timer_expired(&mut self) -> Result<(), OtaError> {
        let state = self.session.as_ref().map(|s| s.ota_state);
        if matches!(state, Some(OtaState::ProcessCompleted) | Some(OtaState::UpdateFw)) {
            if let Some(delay) = self.activate_delay {
                self.collab.activation_info_received(delay);
            }
        }
        Ok(())
    }

    // -- MANIFEST --

    fn handle_manifest(&mut self, frame: Frame) -> Result<(), OtaError> {
        let data = match frame.command {
            Command::Manifest { data } => data,
            _ => return Ok(()),
        };
        // Pass-through delivery only (§1 non-goal: manifest parsing beyond
        // pass-through) — no durable session is established for it.
        self.collab.manifest_received(&data);
        Ok(())
    }

    // -- FRAGMENTS_REQUEST / serve loop --

    fn handle_fragments_request(&mut self, frame: Frame) -> Result<(), OtaError> {
        let (segment_id, bitmask) = match frame.command {
            Command::FragmentsRequest { segment_id, bitmask } => (segment_id, bitmask),
            _ => return Ok(()),
        };
        if !self.matching_session(frame.session_id) {
            return Ok(());
        }
        let state = self.session.as_ref().map(|s| s.ota_state);

        if matches!(state, Some(OtaState::ProcessCompleted) | Some(OtaState::UpdateFw)) {
            if self.fragments_request_service_active {
                warn!("fragment request serving already in progress — ignored");
                return Ok(());
            }
            if self.own_device_type == DeviceType::BorderRouter && self.fw_delivering {
                warn!("firmware delivering already in progress — ignored");
                return Ok(());
            }

            let fragment_count = self.session.as_ref().map(|s| s.fw_fragment_count).unwrap_or(0);
            let mut mask = SegmentRequestMask::new(segment_id, bitmask);
            if mask.next_missing(fragment_count, false).is_some() {
                self.serve = Some(mask);
                self.fragments_request_service_active = true;
                self.arm_fragments_request_service(true);
            } else {
                trace!("no missing fragments in request");
            }
        } else if state == Some(OtaState::MissingFragmentsRequesting) {
            self.arm_missing_fragments_requesting();
        }
        Ok(())
    }

    fn observe_served_fragment(&mut self, frag_id: u16) {
        let Some(mask) = self.serve.as_mut() else { return };
        if crate::bitmask::segment_of(frag_id) != mask.segment_id {
            return;
        }
        mask.mark_served(frag_id);
        self.maybe_end_serve_loop();
    }

    fn maybe_end_serve_loop(&mut self) {
        let fragment_count = self.session.as_ref().map(|s| s.fw_fragment_count).unwrap_or(0);
        let remaining = self
            .serve
            .as_mut()
            .and_then(|m| m.next_missing(fragment_count, false))
            .is_some();
        if !remaining {
            self.fragments_request_service_active = false;
            self.serve = None;
            self.cancel(TimerId::FragmentsRequestService);
        }
    }

    fn fragments_request_service_timer_expired(&mut self) -> Result<(), OtaError> {
        if !self.fragments_request_service_active {
            return Ok(());
        }
        let Some(session) = self.session.clone() else {
            self.fragments_request_service_active = false;
            return Ok(());
        };

        let fragment_id = self
            .serve
            .as_mut()
            .and_then(|m| m.next_missing(session.fw_fragment_count, true));

        let Some(fragment_id) = fragment_id else {
            debug!("all requested fragments sent");
            self.fragments_request_service_active = false;
            self.serve = None;
            return Ok(());
        };

        if let Some(data) = self.read_fragment(&session, fragment_id)? {
            let crc = fragment_crc16(&data);
            let frame = Frame {
                session_id: session.session_id,
                command: Command::Fragment { frag_id: fragment_id, data, crc },
            };
            if let Err(e) = self.collab.send_link_local_multicast(&frame.encode()) {
                warn!("send_link_local_multicast failed: {:?}", e);
            }
        }

        let remaining = self
            .serve
            .as_mut()
            .and_then(|m| m.next_missing(session.fw_fragment_count, false))
            .is_some();
        if remaining {
            self.arm_fragments_request_service(false);
        } else {
            debug!("all requested fragments sent");
            self.fragments_request_service_active = false;
            self.serve = None;
        }
        Ok(())
    }

    pub(crate) fn read_fragment(&mut self, session: &SessionParameters, frag_id: u16) -> Result<Option<Vec<u8>>, OtaError> {
        let offset = (frag_id as u32 - 1) * session.fw_fragment_byte_count as u32;
        let len = core::cmp::min(
            session.fw_fragment_byte_count as u32,
            session.fw_total_byte_count - offset,
        ) as usize;
        let mut buf = alloc::vec![0u8; len];
        let read = self.collab.read_fw(session.session_id, offset, &mut buf).map_err(|e| {
            warn!("read_fw failed: {:?}", e);
            OtaError::StorageError
        })?;
        if read as usize != len {
            warn!("short read building fragment {}: {} of {} bytes", frag_id, read, len);
            return Ok(None);
        }
        Ok(Some(buf))
    }

    // -- FALLBACK --

    fn fallback_timer_expired(&mut self) -> Result<(), OtaError> {
        let Some(session) = self.session.as_ref() else { return Ok(()) };
        if session.ota_state == OtaState::Aborted {
            return Ok(());
        }
        if session.missing_total() == 0 {
            return Ok(());
        }
        debug!("fallback timer fired with fragments still missing, forcing recovery");
        self.set_state(OtaState::MissingFragmentsRequesting);
        self.arm_missing_fragments_requesting();
        self.arm_fallback();
        Ok(())
    }

    // -- MISSING_FRAGMENTS_REQUESTING --

    fn missing_fragments_requesting_timer_expired(&mut self) -> Result<(), OtaError> {
        let Some(session) = self.session.clone() else { return Ok(()) };
        if session.ota_state != OtaState::MissingFragmentsRequesting {
            return Ok(());
        }
        if session.missing_total() == 0 {
            return Ok(());
        }
        self.request_missing_fragments(&session);
        self.arm_missing_fragments_requesting();
        Ok(())
    }

    fn request_missing_fragments(&mut self, session: &SessionParameters) {
        let mut bitmask = [0u8; 16];
        let segment_id = session.fragments_bitmask.first_missing_segment(Some(&mut bitmask));
        if segment_id == 0 {
            return;
        }
        let frame = Frame {
            session_id: session.session_id,
            command: Command::FragmentsRequest { segment_id, bitmask },
        };
        let encoded = frame.encode();

        match self.collab.send_unicast_to_parent(&encoded) {
            Ok(true) => {}
            Ok(false) => trace!("no parent address resolved for FRAGMENTS_REQUEST unicast"),
            Err(e) => warn!("send_unicast_to_parent failed: {:?}", e),
        }
        if let Err(e) = self.collab.send_link_local_multicast(&encoded) {
            warn!("send_link_local_multicast failed: {:?}", e);
        }
    }

    // -- CHECKSUM_CALCULATING --

    fn checksum_calculating_timer_expired(&mut self) -> Result<(), OtaError> {
        let Some(session) = self.session.clone() else { return Ok(()) };
        if session.ota_state != OtaState::ChecksumCalculating {
            return Ok(());
        }
        let session_id = session.session_id;
        let collab = &mut self.collab;
        let step = match self.hasher.as_mut() {
            Some(hasher) => hasher.step(|offset, want| {
                let mut buf = match collab.alloc_scratch(want) {
                    Ok(b) => b,
                    Err(_) => return Ok(None),
                };
                let read = collab.read_fw(session_id, offset, &mut buf)?;
                buf.truncate((read as usize).min(want));
                Ok(Some(buf))
            }),
            None => return Ok(()),
        };

        match step {
            Ok(HasherStep::Continue) => self.arm_checksum_timer(),
            Ok(HasherStep::AllocationFailed) => {
                warn!("checksum slice allocation failed, retrying next tick");
                self.arm_checksum_timer();
            }
            Ok(HasherStep::Finished(digest)) => {
                self.hasher = None;
                if digest == session.whole_fw_checksum {
                    debug!("whole firmware checksum verified");
                    self.set_state(OtaState::ProcessCompleted);
                    self.on_checksum_verified();
                } else {
                    warn!("whole firmware checksum mismatch");
                    self.set_state(OtaState::ChecksumFailed);
                    self.report_error(OtaError::ChecksumFail);
                }
            }
            Err(e) => {
                warn!("read_fw failed while hashing: {:?}", e);
                self.report_error(OtaError::StorageError);
            }
        }
        Ok(())
    }

    fn on_checksum_verified(&mut self) {
        if self.own_device_type == DeviceType::BorderRouter {
            if let Some(session) = self.session.clone() {
                let _ = self.handle_firmware_trigger_from_self(&session);
            }
        } else {
            self.arm_notification(TimerId::EndFragments);
            self.arm_ms(TimerId::FirmwareReady, 1000);
        }
    }

    // -- FIRMWARE_READY --

    fn firmware_ready_timer_expired(&mut self) -> Result<(), OtaError> {
        self.collab.firmware_ready();
        Ok(())
    }

    // -- END_FRAGMENTS notification (shared by both roles, see module docs) --

    fn end_fragments_timer_expired(&mut self) -> Result<(), OtaError> {
        let Some(session) = self.session.clone() else { return Ok(()) };
        let frame = Frame {
            session_id: session.session_id,
            command: Command::EndFragments,
        };
        let encoded = frame.encode();
        let sent = match self.own_device_type {
            DeviceType::BorderRouter => self.collab.send_mpl_multicast(&encoded),
            DeviceType::Node => self.collab.send_link_local_multicast(&encoded),
        };
        if let Err(e) = sent {
            warn!("failed to send END_FRAGMENTS: {:?}", e);
        }

        if self.own_device_type == DeviceType::BorderRouter {
            self.send_estimated_resend_time();
        }
        Ok(())
    }

    fn send_estimated_resend_time(&mut self) {
        let seconds = self.config.missing_fragment_waittime_hours * 3600;
        let mut buf = Vec::with_capacity(4);
        buf.extend_from_slice(&seconds.to_be_bytes());
        self.collab
            .update_resource(crate::collab::ResourceName::EstimatedResendTime, &buf);
    }

    // -- MULTICAST_MESSAGE_SENT (router relay bookkeeping, see router.rs) --

    fn multicast_message_sent_timer_expired(&mut self) -> Result<(), OtaError> {
        if let Some(session_id) = self.relay_session_id.take() {
            if let Err(e) = self.collab.remove_process(session_id) {
                warn!("remove_process failed: {:?}", e);
            }
            // The relay has had a moment to actually leave the radio;
            // free the single-session slot so a subsequent FIRMWARE
            // trigger or START is no longer rejected.
            self.session = None;
            self.reset_session_scratch();
            self.publish_status();
            self.publish_ready();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec;
    use crate::engine::EngineConfig;
    use crate::ids::{DeviceType, SessionId};
    use crate::testutil::{fake_digest, MockCollaborators};

    fn node_engine() -> Engine<MockCollaborators> {
        let collab = MockCollaborators::new();
        Engine::new(collab, DeviceType::Node, EngineConfig::default()).unwrap()
    }

    fn start_frame(session_id: SessionId, frag_count: u16, frag_size: u16, total_size: u32, hash: [u8; 32]) -> Frame {
        Frame {
            session_id,
            command: Command::Start {
                device_type: DeviceType::Node,
                frag_count,
                frag_size,
                total_size,
                hash,
            },
        }
    }

    fn fragment_frame(session_id: SessionId, frag_id: u16, data: Vec<u8>) -> Frame {
        let crc = fragment_crc16(&data);
        Frame {
            session_id,
            command: Command::Fragment { frag_id, data, crc },
        }
    }

    /// Scenario 1 (§8): a clean two-fragment push ends in
    /// PROCESS_COMPLETED with the exact padded bitmask bytes the spec
    /// calls out.
    #[test]
    fn clean_push_reaches_process_completed() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let mut engine = node_engine();
        let session_id = SessionId([1u8; 16]);
        let image: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        let hash = fake_digest(&image);

        engine.handle_frame(start_frame(session_id, 2, 1024, 2048, hash)).unwrap();
        assert_eq!(engine.session().unwrap().ota_state, OtaState::Started);

        engine
            .handle_frame(fragment_frame(session_id, 1, image[0..1024].to_vec()))
            .unwrap();
        engine
            .handle_frame(fragment_frame(session_id, 2, image[1024..2048].to_vec()))
            .unwrap();
        assert_eq!(engine.session().unwrap().ota_state, OtaState::ChecksumCalculating);
        assert_eq!(engine.session().unwrap().fragments_bitmask.as_bytes()[15], 0xFC);

        for _ in 0..4 {
            engine.handle_timer(TimerId::ChecksumCalculating).unwrap();
        }
        assert_eq!(engine.session().unwrap().ota_state, OtaState::ProcessCompleted);

        engine.handle_timer(TimerId::FirmwareReady).unwrap();
        assert_eq!(engine.collab.notify.firmware_ready, 1);
    }

    /// Scenario 4 (§8): a declared hash that doesn't match the actual
    /// bytes ends in CHECKSUM_FAILED, never PROCESS_COMPLETED.
    #[test]
    fn hash_mismatch_reaches_checksum_failed() {
        let mut engine = node_engine();
        let session_id = SessionId([2u8; 16]);
        let image = vec![0xAAu8; 1024];
        let wrong_hash = [0xFFu8; 32];

        engine.handle_frame(start_frame(session_id, 1, 1024, 1024, wrong_hash)).unwrap();
        engine.handle_frame(fragment_frame(session_id, 1, image)).unwrap();
        assert_eq!(engine.session().unwrap().ota_state, OtaState::ChecksumCalculating);

        engine.handle_timer(TimerId::ChecksumCalculating).unwrap();
        engine.handle_timer(TimerId::ChecksumCalculating).unwrap();
        assert_eq!(engine.session().unwrap().ota_state, OtaState::ChecksumFailed);
        assert_eq!(engine.collab.resource(crate::collab::ResourceName::Error).map(|e| e[17]), Some(3));
    }

    /// Scenario 5 (§8): a second START with a different session id while
    /// one is active is rejected and the active session is untouched.
    #[test]
    fn duplicate_session_start_is_rejected() {
        let mut engine = node_engine();
        let first = SessionId([3u8; 16]);
        let second = SessionId([4u8; 16]);
        engine.handle_frame(start_frame(first, 4, 1024, 4096, [0u8; 32])).unwrap();

        let err = engine.handle_frame(start_frame(second, 4, 1024, 4096, [0u8; 32]));
        assert!(err.is_err());
        assert_eq!(engine.session().unwrap().session_id, first);
    }

    #[test]
    fn crc_mismatch_drops_fragment_without_marking() {
        let mut engine = node_engine();
        let session_id = SessionId([5u8; 16]);
        engine.handle_frame(start_frame(session_id, 2, 1024, 2048, [0u8; 32])).unwrap();

        let bad = Frame {
            session_id,
            command: Command::Fragment {
                frag_id: 1,
                data: vec![1u8; 1024],
                crc: 0xFFFF,
            },
        };
        engine.handle_frame(bad).unwrap();
        assert!(!engine.session().unwrap().fragments_bitmask.is_received(1));
        assert_eq!(engine.session().unwrap().missing_total(), 2);
    }

    #[test]
    fn fallback_timer_forces_recovery_when_fragments_missing() {
        let mut engine = node_engine();
        let session_id = SessionId([6u8; 16]);
        engine.handle_frame(start_frame(session_id, 2, 1024, 2048, [0u8; 32])).unwrap();
        engine
            .handle_frame(fragment_frame(session_id, 1, vec![0u8; 1024]))
            .unwrap();

        engine.handle_timer(TimerId::Fallback).unwrap();
        assert_eq!(engine.session().unwrap().ota_state, OtaState::MissingFragmentsRequesting);
    }

    /// Scenario 2 (§8): after END_FRAGMENTS with one fragment missing, a
    /// FRAGMENTS_REQUEST is emitted carrying the right segment and bit.
    #[test]
    fn missing_fragments_requesting_emits_request_for_missing_fragment() {
        let mut engine = node_engine();
        let session_id = SessionId([7u8; 16]);
        engine.handle_frame(start_frame(session_id, 128, 1024, 128 * 1024, [0u8; 32])).unwrap();
        for f in 1..=128u16 {
            if f != 42 {
                engine
                    .handle_frame(fragment_frame(session_id, f, vec![0u8; 1024]))
                    .unwrap();
            }
        }
        engine.handle_frame(Frame { session_id, command: Command::EndFragments }).unwrap();
        assert_eq!(engine.session().unwrap().ota_state, OtaState::MissingFragmentsRequesting);

        engine.handle_timer(TimerId::MissingFragmentsRequesting).unwrap();
        let sent = engine.collab.sent.last().expect("a request went out");
        let decoded = Frame::decode(&sent.bytes).unwrap();
        match decoded.command {
            Command::FragmentsRequest { segment_id, bitmask } => {
                assert_eq!(segment_id, 1);
                // fragment 42 -> local index 41 -> byte 15-41/8=10, bit 1
                assert_eq!(bitmask[10] & (1 << 1), 0);
            }
            other => panic!("wrong command: {:?}", other),
        }
    }

    /// A peer already in PROCESS_COMPLETED serves a requester's missing
    /// fragment, bringing the requester to PROCESS_COMPLETED in turn.
    #[test]
    fn peer_serves_missing_fragment_to_requester() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let session_id = SessionId([8u8; 16]);
        let image: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        let hash = fake_digest(&image);

        // peer already has everything
        let mut peer = node_engine();
        peer.handle_frame(start_frame(session_id, 2, 1024, 2048, hash)).unwrap();
        peer.handle_frame(fragment_frame(session_id, 1, image[0..1024].to_vec())).unwrap();
        peer.handle_frame(fragment_frame(session_id, 2, image[1024..2048].to_vec())).unwrap();
        for _ in 0..4 {
            peer.handle_timer(TimerId::ChecksumCalculating).unwrap();
        }
        assert_eq!(peer.session().unwrap().ota_state, OtaState::ProcessCompleted);

        // requester is missing fragment 2
        let mut requester = node_engine();
        requester.handle_frame(start_frame(session_id, 2, 1024, 2048, hash)).unwrap();
        requester
            .handle_frame(fragment_frame(session_id, 1, image[0..1024].to_vec()))
            .unwrap();
        requester
            .handle_frame(Frame { session_id, command: Command::EndFragments })
            .unwrap();
        assert_eq!(requester.session().unwrap().ota_state, OtaState::MissingFragmentsRequesting);
        requester.handle_timer(TimerId::MissingFragmentsRequesting).unwrap();
        let request = requester.collab.sent.last().unwrap().bytes.clone();

        // peer receives the request and serves the missing fragment
        peer.handle_frame(Frame::decode(&request).unwrap()).unwrap();
        peer.handle_timer(TimerId::FragmentsRequestService).unwrap();
        let served = peer.collab.sent.last().unwrap().bytes.clone();

        requester.handle_frame(Frame::decode(&served).unwrap()).unwrap();
        assert_eq!(requester.session().unwrap().missing_total(), 0);
        for _ in 0..4 {
            requester.handle_timer(TimerId::ChecksumCalculating).unwrap();
        }
        assert_eq!(requester.session().unwrap().ota_state, OtaState::ProcessCompleted);
    }
}
