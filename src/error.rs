//! Crate-wide error type.
//!
//! Every failure that crosses the tool surface is one of a closed set of
//! kinds; callers branch on [`CoreError::kind`], never on message text.
//! Messages carry minimal identifying context (an agent id, a tool name)
//! and never key material, ciphertext, or confirmation codes.

use crate::units::AmountParseError;

/// All failures surfaced by the custody core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// No wallet record exists for the agent.
    #[error("agent not found: {0}")]
    NotFound(String),
    /// A wallet record already exists for the agent.
    #[error("agent already exists: {0}")]
    AgentExists(String),
    /// The derived or imported address is already bound to another agent.
    #[error("address already bound to another agent")]
    AddressReuse,
    /// The destination or queried address does not parse as an EVM address.
    #[error("invalid address: {0}")]
    BadAddress(String),
    /// Imported key material (raw key or mnemonic) is malformed.
    #[error("invalid key material")]
    BadKey,
    /// Ciphertext authentication failed during decryption.
    #[error("key decryption failed for agent {0}")]
    DecryptFailed(String),
    /// A key-export gate was not satisfied.
    #[error("export denied")]
    ExportDenied,
    /// The sliding-window rate limit for this tool is exhausted.
    #[error("rate limited: {tool} ({max_calls} calls / {window_seconds}s)")]
    RateLimited {
        tool: String,
        max_calls: u32,
        window_seconds: u64,
    },
    /// The transfer exceeds the spend threshold and no confirmation code
    /// was supplied.
    #[error("confirmation required for high-value transfer")]
    ConfirmationRequired,
    /// A confirmation code was supplied but does not match.
    #[error("confirmation code mismatch")]
    ConfirmationMismatch,
    /// Balance does not cover amount plus the estimated fee.
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: String, available: String },
    /// No configured endpoint produced a response within the timeout.
    #[error("chain unreachable: {0}")]
    ChainUnreachable(String),
    /// A node responded and refused the transaction or call.
    #[error("rpc rejected: {0}")]
    RpcRejected(String),
    /// A broadcast was accepted but local state could not record it; the
    /// sending address is quarantined until operator intervention.
    #[error("broadcast aborted: address {0} is quarantined")]
    BroadcastAborted(String),
    /// No strategy exists under the label.
    #[error("strategy not found: {0}")]
    StrategyNotFound(String),
    /// The strategy is not in a state that permits the transition.
    #[error("strategy {label} in invalid state: {detail}")]
    StrategyBadState { label: String, detail: String },
    /// Tool arguments failed to parse or validate.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// Persistent store I/O or schema failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl CoreError {
    /// Stable machine-readable kind for this error. Transports and tests
    /// branch on this value.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AgentExists(_) => "agent_exists",
            Self::AddressReuse => "address_reuse",
            Self::BadAddress(_) => "bad_address",
            Self::BadKey => "bad_key",
            Self::DecryptFailed(_) => "decrypt_failed",
            Self::ExportDenied => "export_denied",
            Self::RateLimited { .. } => "rate_limited",
            Self::ConfirmationRequired => "confirmation_required",
            Self::ConfirmationMismatch => "confirmation_mismatch",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::ChainUnreachable(_) => "chain_unreachable",
            Self::RpcRejected(_) => "rpc_rejected",
            Self::BroadcastAborted(_) => "broadcast_aborted",
            Self::StrategyNotFound(_) => "strategy_not_found",
            Self::StrategyBadState { .. } => "strategy_bad_state",
            Self::InvalidParams(_) => "invalid_params",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<AmountParseError> for CoreError {
    fn from(e: AmountParseError) -> Self {
        Self::InvalidParams(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(CoreError::NotFound("a1".into()).kind(), "not_found");
        assert_eq!(CoreError::ConfirmationRequired.kind(), "confirmation_required");
        assert_eq!(
            CoreError::RateLimited {
                tool: "execute_transfer".into(),
                max_calls: 2,
                window_seconds: 60,
            }
            .kind(),
            "rate_limited"
        );
        assert_eq!(CoreError::BroadcastAborted("0xabc".into()).kind(), "broadcast_aborted");
    }

    #[test]
    fn messages_never_echo_secrets() {
        // Variants carry ids and figures only; the constructors accept no
        // secret material, so a display sweep is enough.
        let errors = [
            CoreError::DecryptFailed("a1".into()),
            CoreError::ExportDenied,
            CoreError::ConfirmationMismatch,
        ];
        for e in errors {
            let msg = e.to_string();
            assert!(!msg.contains("0x"), "unexpected material in: {msg}");
        }
    }
}
