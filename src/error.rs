//! Error taxonomy shared by every tunnel operation.
//!
//! Each variant carries a human-readable message that is sent to the
//! controller verbatim. Stale lock files are not an error: detection removes
//! them in place and carries on.

/// Failure of a tunnel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Bad or missing profile fields, invalid URL, unusable identifier.
    Configuration(String),
    /// A precondition reported by the helper or found locally (Wi-Fi mismatch,
    /// port already in use).
    Precondition(String),
    /// Launching, signalling or waiting on a process failed.
    Process(String),
    /// A bounded wait elapsed.
    Timeout(String),
    /// The backend rejected the credentials.
    Authentication(String),
}

impl TunnelError {
    /// Stable name reported to the controller as `errorKind`.
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::Configuration(_) => "ConfigurationError",
            TunnelError::Precondition(_) => "PreconditionError",
            TunnelError::Process(_) => "ProcessError",
            TunnelError::Timeout(_) => "TimeoutError",
            TunnelError::Authentication(_) => "AuthenticationError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TunnelError::Configuration(m)
            | TunnelError::Precondition(m)
            | TunnelError::Process(m)
            | TunnelError::Timeout(m)
            | TunnelError::Authentication(m) => m,
        }
    }

    /// Append extra diagnostic detail (e.g. a log tail) to the message.
    #[must_use]
    pub fn with_detail(self, detail: &str) -> Self {
        let detail = detail.trim();
        if detail.is_empty() {
            return self;
        }
        let join = |m: String| format!("{m}\n{detail}");
        match self {
            TunnelError::Configuration(m) => TunnelError::Configuration(join(m)),
            TunnelError::Precondition(m) => TunnelError::Precondition(join(m)),
            TunnelError::Process(m) => TunnelError::Process(join(m)),
            TunnelError::Timeout(m) => TunnelError::Timeout(join(m)),
            TunnelError::Authentication(m) => TunnelError::Authentication(join(m)),
        }
    }
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for TunnelError {}
