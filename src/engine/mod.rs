//! Top-level owned engine value (§9 "re-architect as an owned `Engine`
//! value"), its `Default`-backed configuration, and the dispatcher's
//! shared helpers (timer arming, status/error/ready resource strings).
//!
//! Command and timer handling proper live in [`node`] (node role) and
//! [`router`] (router role); both extend `Engine<C>` with further
//! `impl` blocks, mirroring how the teacher's MAC layer splits `Core`'s
//! behavior across `mac/core.rs` and `mac/csma.rs`.

mod node;
mod router;

pub use router::FirmwareTrigger;

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, error, warn};

use crate::bitmask::SegmentRequestMask;
use crate::codec::Frame;
use crate::collab::{Collaborators, ResourceName};
use crate::error::OtaError;
use crate::hasher::HasherPipeline;
use crate::ids::{DeviceType, SessionId};
use crate::session::{OtaState, SessionParameters};
use crate::timer::{jittered_expiry_ms, TimerId};

/// Every tunable timer/size constant from §6, each with the specification's
/// default, following the `Config`-with-`Default`-impl idiom already used
/// for MAC configuration in this crate.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub multicast_interval_s: u32,
    pub missing_fragment_fallback_timeout_s: u32,
    pub missing_fragments_requesting_timeout_start_s: u32,
    pub fragments_request_service_timeout_start_s: u32,
    pub timer_random_window_s: u32,
    pub notification_timer_delay_s: u32,
    pub checksum_calculating_byte_count: u32,
    pub checksum_calculating_interval_ms: u32,
    pub default_fragment_byte_count: u16,
    /// Window advertised via the `ESTIMATED_RESEND_TIME` resource after a
    /// node emits its own `END_FRAGMENTS` notification (§6).
    pub missing_fragment_waittime_hours: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            multicast_interval_s: 60,
            missing_fragment_fallback_timeout_s: 1800,
            missing_fragments_requesting_timeout_start_s: 30,
            fragments_request_service_timeout_start_s: 5,
            timer_random_window_s: 60,
            notification_timer_delay_s: 2,
            checksum_calculating_byte_count: 512,
            checksum_calculating_interval_ms: 10,
            default_fragment_byte_count: 1024,
            missing_fragment_waittime_hours: 24,
        }
    }
}

/// The owned engine value. Generic over its [`Collaborators`]
/// implementation rather than reaching for global mutable state and a
/// function-pointer table (§9).
pub struct Engine<C: Collaborators> {
    collab: C,
    config: EngineConfig,
    own_device_type: DeviceType,

    session: Option<SessionParameters>,
    hasher: Option<HasherPipeline<C::Hash>>,
    serve: Option<SegmentRequestMask>,

    // Transient, session-scoped flags (§3); reset whenever a session is
    // created or torn down, never persisted.
    fw_delivering: bool,
    next_deliver_fragment: u16,
    fragments_request_service_active: bool,
    fw_update_received: bool,

    // Carries the delay from an ACTIVATE command through to its
    // notification timer firing.
    activate_delay: Option<u32>,
    // Router-only: the session id a deferred `remove_process` is pending
    // for once the outgoing relay multicast's debounce timer fires.
    relay_session_id: Option<SessionId>,
}

impl<C: Collaborators> Engine<C> {
    /// Constructs the engine, loading any persisted session and
    /// resuming into the state it finds (§4.5 "Restart recovery")
    /// rather than always starting from IDLE.
    pub fn new(mut collab: C, own_device_type: DeviceType, config: EngineConfig) -> Result<Self, OtaError> {
        let loaded = collab.load_session().map_err(|e| {
            error!("load_session failed: {:?}", e);
            OtaError::StorageError
        })?;

        let mut engine = Engine {
            collab,
            config,
            own_device_type,
            session: None,
            hasher: None,
            serve: None,
            fw_delivering: false,
            next_deliver_fragment: 1,
            fragments_request_service_active: false,
            fw_update_received: false,
            activate_delay: None,
            relay_session_id: None,
        };
        engine.reset_session_scratch();

        if let Some(session) = loaded {
            engine.resume_session(session);
        } else {
            engine.publish_status();
            engine.publish_ready();
        }

        Ok(engine)
    }

    fn resume_session(&mut self, session: SessionParameters) {
        let state = session.ota_state;
        let missing = session.missing_total();
        let total = session.fw_total_byte_count;
        debug!("resuming session {} in state {}", session.session_id, state);
        self.session = Some(session);

        match state {
            OtaState::MissingFragmentsRequesting => self.arm_missing_fragments_requesting(),
            OtaState::ChecksumCalculating => {
                let slice_bytes = self.config.checksum_calculating_byte_count;
                self.hasher = Some(HasherPipeline::start_with_slice(self.collab.new_hasher(), total, slice_bytes));
                self.arm_checksum_timer();
            }
            s if !s.is_terminal() && missing > 0 => self.arm_fallback(),
            _ => {}
        }

        self.publish_status();
        self.publish_ready();
    }

    // -- timer helpers --

    fn arm_jittered(&mut self, id: TimerId, base_s: u32, window_s: u32) {
        let draw = self.collab.rand32();
        let ms = jittered_expiry_ms(base_s, window_s, draw);
        self.collab.request_timer(id, ms);
    }

    fn arm_ms(&mut self, id: TimerId, ms: u32) {
        self.collab.request_timer(id, ms);
    }

    fn cancel(&mut self, id: TimerId) {
        self.collab.cancel_timer(id);
    }

    fn cancel_all_timers(&mut self) {
        for id in [
            TimerId::Activate,
            TimerId::EndFragments,
            TimerId::MissingFragmentsRequesting,
            TimerId::FragmentsDelivering,
            TimerId::FragmentsRequestService,
            TimerId::Fallback,
            TimerId::ChecksumCalculating,
            TimerId::MulticastMessageSent,
            TimerId::FirmwareReady,
        ] {
            self.cancel(id);
        }
    }

    fn arm_fallback(&mut self) {
        self.arm_jittered(TimerId::Fallback, self.config.missing_fragment_fallback_timeout_s, 0);
    }

    fn arm_missing_fragments_requesting(&mut self) {
        self.arm_jittered(
            TimerId::MissingFragmentsRequesting,
            self.config.missing_fragments_requesting_timeout_start_s,
            self.config.timer_random_window_s,
        );
    }

    fn arm_fragments_request_service(&mut self, first: bool) {
        let base = if first {
            self.config.fragments_request_service_timeout_start_s
        } else {
            self.config.multicast_interval_s + 30
        };
        self.arm_jittered(TimerId::FragmentsRequestService, base, self.config.timer_random_window_s);
    }

    fn arm_checksum_timer(&mut self) {
        self.arm_ms(TimerId::ChecksumCalculating, self.config.checksum_calculating_interval_ms);
    }

    fn arm_notification(&mut self, id: TimerId) {
        self.arm_jittered(id, self.config.notification_timer_delay_s, self.config.timer_random_window_s);
    }

    // -- resource publishing --

    /// `<uuid-36-chars> [<recv>/<total>] <STATE_NAME>`, the `[recv/total]`
    /// segment present only for a node role with fragments still missing
    /// (§6).
    pub fn status_string(&self) -> String {
        match &self.session {
            Some(s) => {
                let missing = s.missing_total();
                if self.own_device_type == DeviceType::Node && missing > 0 {
                    let recv = s.fw_fragment_count - missing;
                    format!("{} [{}/{}] {}", s.session_id, recv, s.fw_fragment_count, s.ota_state)
                } else {
                    format!("{} {}", s.session_id, s.ota_state)
                }
            }
            None => format!("{} {}", SessionId::ZERO, OtaState::Idle),
        }
    }

    fn publish_status(&mut self) {
        let s = self.status_string();
        self.collab.update_resource(ResourceName::Status, s.as_bytes());
    }

    fn publish_ready(&mut self) {
        let ready = match &self.session {
            None => true,
            Some(s) => s.ota_state.is_terminal(),
        };
        self.collab
            .update_resource(ResourceName::Ready, if ready { b"1" } else { b"0" });
    }

    fn report_error(&mut self, err: OtaError) {
        let session_id = self.session.as_ref().map(|s| s.session_id).unwrap_or(SessionId::ZERO);
        let mut buf = Vec::with_capacity(18);
        buf.push(1u8); // protocol version
        buf.extend_from_slice(session_id.as_bytes());
        buf.push(err.code());
        error!("ota error on session {}: {}", session_id, err);
        self.collab.update_resource(ResourceName::Error, &buf);
        self.publish_ready();
    }

    fn set_state(&mut self, state: OtaState) {
        if let Some(session) = self.session.as_mut() {
            session.ota_state = state;
            debug!("session {} -> {}", session.session_id, state);
        }
        self.publish_status();
        self.publish_ready();
        self.persist();
    }

    fn persist(&mut self) {
        if let Some(session) = self.session.clone() {
            if let Err(e) = self.collab.store_session(&session) {
                warn!("store_session failed: {:?}", e);
            }
        }
    }

    fn matching_session(&self, session_id: SessionId) -> bool {
        self.session.as_ref().map(|s| s.session_id == session_id).unwrap_or(false)
    }

    /// Entry point for any frame arriving off the socket. Routes by
    /// command kind and, where relevant, device role.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<(), OtaError> {
        self.dispatch_frame(frame)
    }

    /// Entry point for a timer expiry. The collaborator is expected to
    /// always cancel the firing timer before invoking this (mirroring
    /// the reference dispatcher, which cancels unconditionally at the
    /// top of every timer handler) — this method does not re-cancel its
    /// own timer id on entry.
    pub fn handle_timer(&mut self, id: TimerId) -> Result<(), OtaError> {
        self.dispatch_timer(id)
    }

    /// Unconditional abort: cancels all timers, frees the hasher, and
    /// moves to ABORTED — except while in UPDATE_FW, which is left
    /// untouched (§4.5).
    pub fn abort(&mut self) -> Result<(), OtaError> {
        self.cancel_all_timers();
        self.hasher = None;
        self.serve = None;
        self.fw_delivering = false;
        self.fragments_request_service_active = false;

        if let Some(session) = self.session.as_ref() {
            let session_id = session.session_id;
            if session.ota_state != OtaState::UpdateFw {
                self.set_state(OtaState::Aborted);
            } else {
                self.publish_status();
                self.publish_ready();
            }
            // Only the border router notifies the application of process
            // completion on abort (`ota_manage_abort_command` in the
            // reference only fires `ota_process_finished_fptr` for
            // `OTA_DEVICE_TYPE_BORDER_ROUTER`); a node's own ABORT handling
            // has no equivalent lifecycle callback.
            if self.own_device_type == DeviceType::BorderRouter {
                self.collab.process_finished(session_id);
            }
        }
        Ok(())
    }

    pub fn own_device_type(&self) -> DeviceType {
        self.own_device_type
    }

    pub fn session(&self) -> Option<&SessionParameters> {
        self.session.as_ref()
    }

    /// Clears every engine-local scratch field a session leaves behind,
    /// without touching `self.session` itself. Called both when a fresh
    /// session is about to be installed and when an old one is freed, so
    /// no state from a prior session (delivery cursor, serve mask,
    /// pending activation delay, ...) ever leaks into the next one (§9
    /// Open Question: no fragment-data carryover across sessions).
    pub(crate) fn reset_session_scratch(&mut self) {
        self.hasher = None;
        self.serve = None;
        self.fw_delivering = false;
        self.next_deliver_fragment = 1;
        self.fragments_request_service_active = false;
        self.fw_update_received = false;
        self.activate_delay = None;
        self.relay_session_id = None;
    }

    /// Frees the single-session slot (§3 invariant: at most one session
    /// exists). The reference implementation calls this a *session
    /// delete*, distinct from `abort()`: it is expected to follow a
    /// terminal state (§5 "a subsequent session_delete frees the
    /// bitmask"), but is not itself restricted to one, since an operator
    /// may also want to discard a session stuck mid-transfer.
    pub fn delete_session(&mut self) -> Result<(), OtaError> {
        self.cancel_all_timers();
        if let Some(session) = self.session.take() {
            if let Err(e) = self.collab.remove_process(session.session_id) {
                warn!("remove_process failed: {:?}", e);
            }
        }
        self.reset_session_scratch();
        self.publish_status();
        self.publish_ready();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::MockCollaborators;

    #[test]
    fn fresh_engine_starts_idle() {
        let collab = MockCollaborators::new();
        let engine = Engine::new(collab, DeviceType::Node, EngineConfig::default()).unwrap();
        assert!(engine.session().is_none());
        assert_eq!(engine.status_string(), format!("{} IDLE", SessionId::ZERO));
    }
}
