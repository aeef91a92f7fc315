//! The error kinds observed at the router's core boundary. Most of these
//! never unwind out of a session — they are turned into a client-visible
//! ERR packet or a backend state transition by the caller — but giving
//! them a typed home keeps the handling sites honest about which kind
//! they are reacting to.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("query shape rejected by classifier: {0}")]
    ClassificationReject(String),

    #[error("no eligible backend for this statement")]
    NoBackend,

    #[error("backend '{backend}' failed: {source}")]
    BackendFailure {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend '{backend}' diverged from the reference reply")]
    ConsistencyDiverge { backend: String },

    #[error("session-command history exceeded max_sescmd_history={cap}")]
    HistoryOverflow { cap: usize },

    #[error("master connection lost while a transaction was open")]
    TransactionLoss,

    #[error("masking rules file is malformed: {0}")]
    RulesParse(String),

    #[error("masking rule produced no valid rewrite: {0}")]
    RulesRewriteNop(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// Whether this error, left unhandled, must force-close the owning
    /// router session rather than merely degrade a backend.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, RouterError::TransactionLoss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transaction_loss_is_session_fatal() {
        assert!(RouterError::TransactionLoss.is_session_fatal());
        assert!(!RouterError::NoBackend.is_session_fatal());
        assert!(!RouterError::HistoryOverflow { cap: 200 }.is_session_fatal());
    }
}
