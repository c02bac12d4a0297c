//! The single capability trait the engine is generic over (§4.6, §9
//! "function-pointer soup → one object implementing all the
//! operations"). An embedder supplies one concrete implementation
//! covering storage, transport, notifications, timers and RNG.

use alloc::vec::Vec;

use crate::hasher::HashContext;
use crate::ids::SessionId;
use crate::session::SessionParameters;
use crate::timer::TimerId;

/// Keys for `update_resource`, mirroring the cloud-visible resource set
/// in §4.6/§6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceName {
    Status,
    Ready,
    SessionId,
    Error,
    EstimatedResendTime,
}

/// Everything the dispatcher needs from its environment. Splitting this
/// into Transport/Storage/Clock traits was considered (§9) and rejected:
/// almost every handler in this protocol already needs to touch more
/// than one of those concerns in a single call (a `FRAGMENT` handler
/// writes storage, rearms a timer, and may emit a notification), so one
/// trait keeps call sites from threading three generic parameters through
/// every method for no real decoupling benefit.
pub trait Collaborators {
    type Error: core::fmt::Debug;
    type Hash: HashContext;

    // -- session persistence --
    fn store_session(&mut self, session: &SessionParameters) -> Result<(), Self::Error>;
    fn load_session(&mut self) -> Result<Option<SessionParameters>, Self::Error>;
    fn store_new_process(&mut self, session_id: SessionId) -> Result<(), Self::Error>;
    fn remove_process(&mut self, session_id: SessionId) -> Result<(), Self::Error>;

    // -- firmware storage --
    fn write_fw(&mut self, session_id: SessionId, offset: u32, buf: &[u8]) -> Result<u32, Self::Error>;
    fn read_fw(&mut self, session_id: SessionId, offset: u32, buf: &mut [u8]) -> Result<u32, Self::Error>;

    // -- transport: three distinct address scopes (§4.6) --
    fn send_mpl_multicast(&mut self, buf: &[u8]) -> Result<(), Self::Error>;
    fn send_link_local_multicast(&mut self, buf: &[u8]) -> Result<(), Self::Error>;
    /// Returns `true` if a parent address resolved and the unicast was
    /// sent; `false` if no parent address is currently known (not an
    /// error — recovery still proceeds via multicast).
    fn send_unicast_to_parent(&mut self, buf: &[u8]) -> Result<bool, Self::Error>;

    // -- cloud-facing resources --
    fn update_resource(&mut self, name: ResourceName, value: &[u8]);

    // -- application lifecycle notifications --
    fn start_received(&mut self, session: &SessionParameters);
    fn process_finished(&mut self, session_id: SessionId);
    fn manifest_received(&mut self, buf: &[u8]);
    fn firmware_ready(&mut self);
    /// `delay_seconds` as received on the `ACTIVATE` command, handed to
    /// the embedder exactly once per session (§8 scenario 6).
    fn activation_info_received(&mut self, delay_seconds: u32);

    // -- timers --
    fn request_timer(&mut self, id: TimerId, delay_ms: u32);
    fn cancel_timer(&mut self, id: TimerId);

    // -- rng --
    fn rand32(&mut self) -> u32;

    // -- memory --
    /// Fallible scratch allocation, modeling the reference
    /// implementation's `malloc`; there is no matching `free` method
    /// since an owned `Vec` releases its own memory on drop.
    fn alloc_scratch(&mut self, len: usize) -> Result<Vec<u8>, Self::Error>;

    // -- hashing --
    fn new_hasher(&self) -> Self::Hash;
}
