//! Library error boundary for operator-facing calls: config loading and the
//! admin surface.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CorrectorError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Work item not found: {0}")]
    ItemNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::CorrectionType;

    #[test]
    fn store_errors_display_transparently() {
        let err: CorrectorError = StoreError::DuplicateActive {
            subject_key: "golf".into(),
            correction_type: CorrectionType::Title,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "an active title item already exists for subject golf"
        );
    }

    #[test]
    fn toml_errors_convert() {
        let err: CorrectorError = toml::from_str::<toml::Value>("tiers = [").unwrap_err().into();
        assert!(err.to_string().starts_with("TOML parse error"));
    }

    #[test]
    fn config_error_display() {
        let err = CorrectorError::Config("no tiers configured".into());
        assert_eq!(err.to_string(), "Config error: no tiers configured");
    }
}
