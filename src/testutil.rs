//! In-memory mock [`Collaborators`] for tests (§9 "tests instantiate
//! many engines concurrently with mock collaborators"), in the style of
//! the teacher's `radio::mock::MockRadio` / `timer::mock::MockTimer`
//! test doubles: plain structs recording everything they're asked to do
//! so a test can assert on them afterward, rather than a mocking-crate
//! expectation DSL.

use alloc::vec;
use alloc::vec::Vec;

use crate::collab::{Collaborators, ResourceName};
use crate::hasher::HashContext;
use crate::ids::SessionId;
use crate::session::SessionParameters;
use crate::timer::TimerId;

/// The mock's own failure mode, distinct from the protocol-level
/// `OtaError` the engine maps collaborator failures onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    AlreadyExists,
    Injected,
}

/// XOR-fold hash double: deterministic and independent of any real
/// crypto primitive, cheap enough for scenario tests that push whole
/// multi-kilobyte images through the pipeline.
#[derive(Default)]
pub struct FakeHash([u8; 32]);

impl HashContext for FakeHash {
    fn update(&mut self, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.0[i % 32] ^= *b;
        }
    }

    fn finalize(self) -> [u8; 32] {
        self.0
    }
}

/// The digest [`FakeHash`] would produce over `data`, for building
/// expected `whole_fw_checksum` values in tests.
pub fn fake_digest(data: &[u8]) -> [u8; 32] {
    let mut ctx = FakeHash::default();
    ctx.update(data);
    ctx.finalize()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentTo {
    MplMulticast,
    LinkLocalMulticast,
    UnicastParent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub to: SentTo,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub id: TimerId,
    pub delay_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifyCounts {
    pub start_received: u32,
    pub process_finished: u32,
    pub manifest_received: u32,
    pub firmware_ready: u32,
    pub activation_info: u32,
}

/// In-memory stand-in for every external collaborator in §4.6: session
/// persistence, firmware storage, the three transport scopes, the
/// cloud-facing resources, application lifecycle notifications, timers,
/// RNG and scratch allocation.
pub struct MockCollaborators {
    pub stored_session: Option<SessionParameters>,
    pub active_processes: Vec<SessionId>,
    firmware: Vec<(SessionId, Vec<u8>)>,
    pub sent: Vec<SentFrame>,
    resources: Vec<(ResourceName, Vec<u8>)>,
    pub timers: Vec<TimerRequest>,
    pub notify: NotifyCounts,
    pub manifests: Vec<Vec<u8>>,
    pub activation_delays: Vec<u32>,
    pub parent_addr: Option<[u8; 16]>,
    rand_sequence: Vec<u32>,
    rand_cursor: usize,
    pub fail_write: bool,
    pub fail_read: bool,
    pub fail_alloc: bool,
}

impl MockCollaborators {
    pub fn new() -> Self {
        MockCollaborators {
            stored_session: None,
            active_processes: Vec::new(),
            firmware: Vec::new(),
            sent: Vec::new(),
            resources: Vec::new(),
            timers: Vec::new(),
            notify: NotifyCounts::default(),
            manifests: Vec::new(),
            activation_delays: Vec::new(),
            parent_addr: None,
            rand_sequence: Vec::new(),
            rand_cursor: 0,
            fail_write: false,
            fail_read: false,
            fail_alloc: false,
        }
    }

    /// Fixes the sequence `rand32()` returns, for deterministic timer
    /// jitter and session id generation in tests. Once exhausted,
    /// further calls return 0.
    pub fn with_rand_sequence(mut self, seq: Vec<u32>) -> Self {
        self.rand_sequence = seq;
        self
    }

    pub fn seed_firmware(&mut self, session_id: SessionId, bytes: Vec<u8>) {
        self.firmware.retain(|(id, _)| *id != session_id);
        self.firmware.push((session_id, bytes));
    }

    pub fn resource(&self, name: ResourceName) -> Option<&[u8]> {
        self.resources.iter().find(|(n, _)| *n == name).map(|(_, v)| v.as_slice())
    }

    pub fn pending_timer(&self, id: TimerId) -> Option<TimerRequest> {
        self.timers.iter().find(|t| t.id == id).copied()
    }

    fn firmware_entry(&mut self, session_id: SessionId) -> &mut Vec<u8> {
        if let Some(pos) = self.firmware.iter().position(|(id, _)| *id == session_id) {
            &mut self.firmware[pos].1
        } else {
            self.firmware.push((session_id, Vec::new()));
            let last = self.firmware.len() - 1;
            &mut self.firmware[last].1
        }
    }
}

impl Default for MockCollaborators {
    fn default() -> Self {
        Self::new()
    }
}

impl Collaborators for MockCollaborators {
    type Error = MockError;
    type Hash = FakeHash;

    fn store_session(&mut self, session: &SessionParameters) -> Result<(), Self::Error> {
        self.stored_session = Some(session.clone());
        Ok(())
    }

    fn load_session(&mut self) -> Result<Option<SessionParameters>, Self::Error> {
        Ok(self.stored_session.clone())
    }

    fn store_new_process(&mut self, session_id: SessionId) -> Result<(), Self::Error> {
        if !self.active_processes.is_empty() {
            return Err(MockError::AlreadyExists);
        }
        self.active_processes.push(session_id);
        Ok(())
    }

    fn remove_process(&mut self, session_id: SessionId) -> Result<(), Self::Error> {
        self.active_processes.retain(|id| *id != session_id);
        Ok(())
    }

    fn write_fw(&mut self, session_id: SessionId, offset: u32, buf: &[u8]) -> Result<u32, Self::Error> {
        if self.fail_write {
            return Ok(0);
        }
        let offset = offset as usize;
        let end = offset + buf.len();
        let entry = self.firmware_entry(session_id);
        if entry.len() < end {
            entry.resize(end, 0);
        }
        entry[offset..end].copy_from_slice(buf);
        Ok(buf.len() as u32)
    }

    fn read_fw(&mut self, session_id: SessionId, offset: u32, buf: &mut [u8]) -> Result<u32, Self::Error> {
        if self.fail_read {
            return Ok(0);
        }
        let offset = offset as usize;
        let entry = self.firmware_entry(session_id);
        if offset >= entry.len() {
            return Ok(0);
        }
        let n = buf.len().min(entry.len() - offset);
        buf[..n].copy_from_slice(&entry[offset..offset + n]);
        Ok(n as u32)
    }

    fn send_mpl_multicast(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.sent.push(SentFrame {
            to: SentTo::MplMulticast,
            bytes: buf.to_vec(),
        });
        Ok(())
    }

    fn send_link_local_multicast(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.sent.push(SentFrame {
            to: SentTo::LinkLocalMulticast,
            bytes: buf.to_vec(),
        });
        Ok(())
    }

    fn send_unicast_to_parent(&mut self, buf: &[u8]) -> Result<bool, Self::Error> {
        if self.parent_addr.is_some() {
            self.sent.push(SentFrame {
                to: SentTo::UnicastParent,
                bytes: buf.to_vec(),
            });
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn update_resource(&mut self, name: ResourceName, value: &[u8]) {
        if let Some(slot) = self.resources.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value.to_vec();
        } else {
            self.resources.push((name, value.to_vec()));
        }
    }

    fn start_received(&mut self, _session: &SessionParameters) {
        self.notify.start_received += 1;
    }

    fn process_finished(&mut self, _session_id: SessionId) {
        self.notify.process_finished += 1;
    }

    fn manifest_received(&mut self, buf: &[u8]) {
        self.notify.manifest_received += 1;
        self.manifests.push(buf.to_vec());
    }

    fn firmware_ready(&mut self) {
        self.notify.firmware_ready += 1;
    }

    fn activation_info_received(&mut self, delay_seconds: u32) {
        self.notify.activation_info += 1;
        self.activation_delays.push(delay_seconds);
    }

    fn request_timer(&mut self, id: TimerId, delay_ms: u32) {
        self.timers.retain(|t| t.id != id);
        self.timers.push(TimerRequest { id, delay_ms });
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.timers.retain(|t| t.id != id);
    }

    fn rand32(&mut self) -> u32 {
        if self.rand_cursor < self.rand_sequence.len() {
            let v = self.rand_sequence[self.rand_cursor];
            self.rand_cursor += 1;
            v
        } else {
            0
        }
    }

    fn alloc_scratch(&mut self, len: usize) -> Result<Vec<u8>, Self::Error> {
        if self.fail_alloc {
            Err(MockError::Injected)
        } else {
            Ok(vec![0u8; len])
        }
    }

    fn new_hasher(&self) -> Self::Hash {
        FakeHash::default()
    }
}
