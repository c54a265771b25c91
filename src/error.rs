//! Error taxonomy for the switch engine boundary.
//!
//! Everything below the engine uses `anyhow`; the engine converts whatever it
//! caught into one of these variants so callers get a single human-readable
//! reason and can tell a rejected request apart from a failed one.

use thiserror::Error;

/// Result type returned by every public engine operation
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// No identity with this id in the catalog
    #[error("Identity '{id}' does not exist")]
    UnknownIdentity { id: String },

    /// The identity exists but its data directory is missing or empty
    #[error("Identity '{label}' has no captured data yet. Log in and save it first.")]
    NotCaptured { id: String, label: String },

    /// The requested label is not usable
    #[error("Invalid label: {reason}")]
    InvalidLabel { reason: String },

    /// Another capture/switch/update is already running
    #[error("Another account operation is in progress: {holder}")]
    Busy { holder: String },

    /// A step of the sequence failed after side effects may have started
    #[error("{step} failed: {source:#}")]
    Failed {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    pub fn failed(step: &'static str, source: anyhow::Error) -> Self {
        Self::Failed { step, source }
    }

    /// Rejected before any side effect happened
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::UnknownIdentity { .. }
                | Self::NotCaptured { .. }
                | Self::InvalidLabel { .. }
                | Self::Busy { .. }
        )
    }
}

/// Attach the failing step name to an `anyhow` result
pub(crate) trait StepContext<T> {
    fn step(self, step: &'static str) -> EngineResult<T>;
}

impl<T> StepContext<T> for anyhow::Result<T> {
    fn step(self, step: &'static str) -> EngineResult<T> {
        self.map_err(|e| EngineError::failed(step, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        let unknown = EngineError::UnknownIdentity { id: "abc".into() };
        assert!(unknown.is_precondition());
        assert_eq!(unknown.to_string(), "Identity 'abc' does not exist");

        let failed = EngineError::failed("mirror", anyhow::anyhow!("disk full"));
        assert!(!failed.is_precondition());
        assert_eq!(failed.to_string(), "mirror failed: disk full");
    }

    #[test]
    fn test_step_context() {
        let res: anyhow::Result<()> = Err(anyhow::anyhow!("locked"));
        let err = res.step("remove live state").unwrap_err();
        assert!(matches!(err, EngineError::Failed { step: "remove live state", .. }));
    }
}
