// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Engine-level errors.
//!
//! Only two kinds of failure ever leave the engine. A configuration problem is
//! rejected at construction. A protocol invariant violation is returned only
//! when the router runs in strict mode. Malformed packets, missing routes and
//! missing RPs are not errors: they are logged, counted, and the operation is
//! retried on the next relevant event.

use thiserror::Error;

use crate::config::ConfigError;
use crate::IfIndex;

#[derive(Debug, Error)]
pub enum PimError {
    /// A state machine was asked to act on state that must exist but does not
    #[error("protocol invariant violated: {0}")]
    InvariantViolation(String),

    #[error("interface {0} is not PIM-enabled")]
    UnknownInterface(IfIndex),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PimError::InvariantViolation("missing (*,G) entry".to_string());
        assert_eq!(
            err.to_string(),
            "protocol invariant violated: missing (*,G) entry"
        );

        let err = PimError::UnknownInterface(IfIndex(7));
        assert_eq!(err.to_string(), "interface if7 is not PIM-enabled");
    }

    #[test]
    fn test_config_error_converts() {
        let err: PimError = ConfigError::ParseError("bad".to_string()).into();
        assert!(matches!(err, PimError::Config(_)));
    }
}
