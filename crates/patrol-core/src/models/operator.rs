//! Operator identity

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity used when no signed-in operator is known.
pub const GUEST_OPERATOR_ID: &str = "guest_user";

/// Opaque operator identifier supplied by the session layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorId(String);

impl OperatorId {
    /// Wrap an identifier, falling back to the guest operator when blank
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            Self::guest()
        } else {
            Self(trimmed.to_string())
        }
    }

    #[must_use]
    pub fn guest() -> Self {
        Self(GUEST_OPERATOR_ID.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OperatorId {
    fn default() -> Self {
        Self::guest()
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_operator_falls_back_to_guest() {
        assert_eq!(OperatorId::new("  ").as_str(), GUEST_OPERATOR_ID);
        assert_eq!(OperatorId::new(" op-7 ").as_str(), "op-7");
    }
}
