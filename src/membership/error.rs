/// Errors surfaced by the membership layer.
///
/// None of them is fatal to the agent: loops log them and carry on with the next peer or the
/// next tick. Rejections by the state machine (stale incarnation, zone admission) are not
/// errors at all.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("network failure talking to {peer}: {source}")]
    TransientNetwork {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no answer from {0} in time")]
    Timeout(String),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected reply from {0}")]
    UnexpectedReply(String),

    #[error("zone '{0}' is not allowed to sync with us")]
    UnauthorizedZone(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("local i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl MembershipError {
    pub fn network(peer: impl Into<String>, source: std::io::Error) -> Self {
        MembershipError::TransientNetwork {
            peer: peer.into(),
            source,
        }
    }

    /// Failures that are expected to go away on their own: retry next tick, or fall back to an
    /// indirect probe.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MembershipError::TransientNetwork { .. }
                | MembershipError::Timeout(_)
                | MembershipError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MembershipError>;
