//! Error types for localtls operations.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for localtls operations.
#[derive(Error, Debug)]
pub enum LocalTlsError {
    #[error("policy violation for \"{name}\": {reason}")]
    PolicyViolation {
        name: String,
        #[source]
        reason: PolicyError,
    },

    #[error("certificate authority is not initialized (run `tls init` first)")]
    NotInitialized,

    #[error("certificate authority is already initialized")]
    AlreadyInitialized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("certificate inventory is corrupt: {0}")]
    StoreCorrupt(String),

    #[error("I/O error at {path}: {cause}")]
    Io {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("issuance failed: {0}")]
    Issuance(String),

    #[error("trust store error: {0}")]
    Trust(#[from] TrustError),

    #[error("certificate generation error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Domain-name policy rejection reasons.
///
/// These are expected, structured outcomes rather than faults; the CLI
/// maps them to exit code 2.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("not a valid DNS name: {0}")]
    InvalidName(String),

    #[error("wildcard must be the single left-most label")]
    WildcardPosition,

    #[error("wildcard base must contain at least two labels")]
    WildcardTooShallow,

    #[error("top-level domain is not in the local-development allowlist")]
    TldNotAllowed,

    #[error("name falls under a public IANA top-level domain")]
    TldPublic,

    #[error("IP address is neither loopback nor private: {0}")]
    IpNotLocal(std::net::IpAddr),

    #[error("request contains no subject alternative names")]
    EmptyRequest,
}

/// Trust-store installer errors.
#[derive(Error, Debug)]
pub enum TrustError {
    #[error("no usable trust-store backend: {0}")]
    BackendUnavailable(String),

    #[error("privilege escalation denied: {0}")]
    EscalationDenied(String),

    #[error("trust-store helper timed out after {0}s")]
    Timeout(u64),

    #[error("trust-store helper failed: {0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LocalTlsError {
    /// Map an error to the CLI exit code contract:
    /// 2 policy violation, 3 not found, 4 trust-store failure, 1 other.
    pub fn exit_code(&self) -> i32 {
        match self {
            LocalTlsError::PolicyViolation { .. } => 2,
            LocalTlsError::NotFound(_) => 3,
            LocalTlsError::Trust(_) => 4,
            _ => 1,
        }
    }

    /// Attach a path to a raw I/O error.
    pub fn io(path: impl Into<PathBuf>, cause: std::io::Error) -> Self {
        LocalTlsError::Io {
            path: path.into(),
            cause,
        }
    }
}

/// Result type alias for localtls operations.
pub type Result<T> = std::result::Result<T, LocalTlsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LocalTlsError::PolicyViolation {
            name: "evil.com".to_string(),
            reason: PolicyError::TldNotAllowed,
        };
        assert!(err.to_string().contains("evil.com"));
    }

    #[test]
    fn test_exit_codes() {
        let policy = LocalTlsError::PolicyViolation {
            name: "x".into(),
            reason: PolicyError::WildcardTooShallow,
        };
        assert_eq!(policy.exit_code(), 2);
        assert_eq!(LocalTlsError::NotFound("serial".into()).exit_code(), 3);
        assert_eq!(LocalTlsError::Trust(TrustError::Timeout(10)).exit_code(), 4);
        assert_eq!(LocalTlsError::NotInitialized.exit_code(), 1);
    }

    #[test]
    fn test_trust_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: LocalTlsError = TrustError::from(io_err).into();
        assert!(matches!(err, LocalTlsError::Trust(_)));
    }
}
