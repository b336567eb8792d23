use super::source::SourceError;

/// Configuration error for typed config operations
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The section did not exist. On persistent backends the caller's default
    /// has been written back as the initial value.
    #[error("config section '{key}' not found in source '{backend}'")]
    NotFound { key: String, backend: String },
    #[error("invalid config for section '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot serialize default for section '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("source '{backend}' failed for section '{key}': {source}")]
    Source {
        key: String,
        backend: String,
        #[source]
        source: SourceError,
    },
    #[error("no config source registered under '{name}'")]
    UnknownSource { name: String },
    #[error("failed to load settings: {0}")]
    Load(#[from] Box<figment::Error>),
}

impl ConfigError {
    /// True for the distinguished "section was missing" condition.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn from_source(key: &str, backend: &str, err: SourceError) -> Self {
        if err.is_not_found() {
            Self::NotFound {
                key: key.to_owned(),
                backend: backend.to_owned(),
            }
        } else {
            Self::Source {
                key: key.to_owned(),
                backend: backend.to_owned(),
                source: err,
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn source_not_found_maps_to_not_found() {
        let err = ConfigError::from_source(
            "cache",
            "kv",
            SourceError::NotFound {
                key: "cache".to_owned(),
            },
        );
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "config section 'cache' not found in source 'kv'");
    }

    #[test]
    fn other_source_errors_are_wrapped() {
        let err = ConfigError::from_source("cache", "kv", SourceError::WatchUnsupported);
        assert!(!err.is_not_found());
        assert!(matches!(err, ConfigError::Source { .. }));
    }
}
