//! Error taxonomy for the detection pipeline.
//!
//! Errors are split by where they can sensibly be handled: configuration
//! problems abort the run, while data problems are logged and the
//! affected metric or group is skipped. Degradations that never cross an
//! API boundary (inconsistent topology, malformed trace rows) are logged
//! where they happen instead of being carried here.

/// All failures surfaced by the detection crate.
#[derive(Debug, Clone)]
pub enum DetectError {
    /// Filesystem access failed.
    Io { path: String, detail: String },
    /// A JSON document or trace payload could not be decoded.
    Parse { context: String, detail: String },
    /// A configuration file was loaded but failed validation.
    InvalidConfig { field: String, detail: String },
    /// An input the pipeline requires was absent.
    DataMissing { what: String },
}

impl DetectError {
    pub fn io(path: impl Into<String>, err: &std::io::Error) -> Self {
        DetectError::Io {
            path: path.into(),
            detail: err.to_string(),
        }
    }

    pub fn parse(context: impl Into<String>, err: &serde_json::Error) -> Self {
        DetectError::Parse {
            context: context.into(),
            detail: err.to_string(),
        }
    }

    pub fn invalid_config(field: impl Into<String>, detail: impl Into<String>) -> Self {
        DetectError::InvalidConfig {
            field: field.into(),
            detail: detail.into(),
        }
    }

    pub fn data_missing(what: impl Into<String>) -> Self {
        DetectError::DataMissing { what: what.into() }
    }
}

impl std::fmt::Display for DetectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectError::Io { path, detail } => {
                write!(f, "io failure at {}: {}", path, detail)
            }
            DetectError::Parse { context, detail } => {
                write!(f, "parse failure in {}: {}", context, detail)
            }
            DetectError::InvalidConfig { field, detail } => {
                write!(f, "invalid config field {}: {}", field, detail)
            }
            DetectError::DataMissing { what } => {
                write!(f, "missing input: {}", what)
            }
        }
    }
}

impl std::error::Error for DetectError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = DetectError::invalid_config("aggregation.funcs", "at least one reducer required");
        let text = err.to_string();
        assert!(
            text.contains("aggregation.funcs"),
            "field name should appear in message: {}",
            text
        );
        assert!(text.contains("reducer"), "detail should appear: {}", text);
    }

    #[test]
    fn io_helper_keeps_path() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = DetectError::io("/tmp/traces.json", &inner);
        assert!(err.to_string().contains("/tmp/traces.json"));
    }
}
