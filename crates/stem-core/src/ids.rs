//! Execution identifiers.
//!
//! ULID なので生成順にソートでき、調整なしで複数プロセスから発行できる。
//! Display は `exec-<ulid>` 形式。

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifies one `TaskMaster::execute` call.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Ulid);

impl ExecutionId {
    pub const PREFIX: &'static str = "exec-";

    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_has_prefix() {
        let id = ExecutionId::from_ulid(Ulid::from_bytes([0; 16]));
        assert_eq!(id.to_string(), "exec-00000000000000000000000000");
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        assert_ne!(a, b);
        assert!(a.as_ulid().timestamp_ms() <= b.as_ulid().timestamp_ms());
    }
}
