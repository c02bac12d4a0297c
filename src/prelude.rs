//! Convenience re-export of the types most call sites need: the engine
//! itself, the collaborator trait an embedder implements, and the wire
//! and data-model types that show up in collaborator method signatures.

pub use crate::codec::{Command, Frame};
pub use crate::collab::{Collaborators, ResourceName};
pub use crate::engine::{Engine, EngineConfig, FirmwareTrigger};
pub use crate::error::OtaError;
pub use crate::ids::{DeviceType, SessionId};
pub use crate::session::{OtaState, SessionParameters};
pub use crate::timer::TimerId;
