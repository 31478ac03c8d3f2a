use serde::{Deserialize, Serialize};

/// Classification of a step failure.
///
/// Retry policies decide on the kind alone, never on the message, so two
/// failures of the same kind at the same attempt always get the same answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, reset, DNS failure.
    Network,
    /// The remote call did not answer within the adapter's deadline.
    Timeout,
    /// The remote service reported itself temporarily unavailable.
    Unavailable,
    /// The request was malformed and will never succeed as sent.
    Validation,
    /// The remote service rejected the request on business grounds.
    BusinessRule,
    /// The run was cancelled at a step boundary.
    Cancelled,
    /// Anything else, including bugs in the step itself.
    Internal,
}

impl ErrorKind {
    /// Returns true for kinds that may succeed if simply tried again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Unavailable
        )
    }

    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Validation => "validation",
            ErrorKind::BusinessRule => "business_rule",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
