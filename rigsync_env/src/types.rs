//! Common types for the rigsync environment abstraction.

use serde::{Deserialize, Serialize};

/// Identifier of one capture session.
///
/// A session is the lifetime of one synchronizer run: sync indices restart
/// at zero for every new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{:04}", self.0)
    }
}
