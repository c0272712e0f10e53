use crate::license::{LicenseState, TransitionKind};
use crate::types::{LicenseId, Role};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("transition `{kind}` is not defined from state `{from}`")]
    InvalidTransition {
        from: LicenseState,
        kind: TransitionKind,
    },
    #[error("role `{role}` is not authorised to {action}")]
    Unauthorized { role: Role, action: String },
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    #[error("invalid module set: {0}")]
    InvalidModuleSet(String),
    #[error("license {license_id} is {state} and cannot be billed")]
    LicenseNotActive {
        license_id: LicenseId,
        state: LicenseState,
    },
    #[error("license {0} has a mutation in flight or moved on; reload and retry")]
    LicenseBusy(LicenseId),
    #[error("ledger write failed after {attempts} attempt(s): {reason}")]
    LedgerWriteFailure { attempts: u32, reason: String },
    #[error("license {0} does not exist")]
    LicenseNotFound(LicenseId),
    #[error("stored record could not be decoded: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Caller-correctable failures; never retried by the engine.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidTransition { .. }
                | EngineError::Unauthorized { .. }
                | EngineError::PolicyViolation(_)
                | EngineError::InvalidModuleSet(_)
                | EngineError::LicenseNotActive { .. }
                | EngineError::LicenseNotFound(_)
        )
    }
}

impl From<minicbor::decode::Error> for EngineError {
    fn from(value: minicbor::decode::Error) -> Self {
        EngineError::Corrupt(value.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}
