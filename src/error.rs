use thiserror::Error;

/// Errors surfaced by the meeting intelligence engine.
///
/// Missing history is not an error: the learner returns no pattern and every
/// consumer has a neutral path for that case.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to fetch {what}: {source}")]
    UpstreamFetch {
        what: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("no calendars available for grant '{0}'")]
    NoCalendars(String),

    #[error("insufficient history: {0}")]
    InsufficientHistory(String),
}

impl EngineError {
    pub fn fetch(what: impl Into<String>, source: anyhow::Error) -> Self {
        EngineError::UpstreamFetch {
            what: what.into(),
            source,
        }
    }

    pub fn timed_out(what: impl Into<String>, seconds: u64) -> Self {
        let what = what.into();
        let source = anyhow::anyhow!("timed out after {}s", seconds);
        EngineError::UpstreamFetch { what, source }
    }

    /// True for errors that come from the calendar backend rather than the caller's input.
    pub fn is_upstream(&self) -> bool {
        matches!(self, EngineError::UpstreamFetch { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_message_includes_source() {
        let err = EngineError::fetch("events for calendar 'work'", anyhow::anyhow!("HTTP 503"));
        assert!(err.is_upstream());
        assert_eq!(
            err.to_string(),
            "failed to fetch events for calendar 'work': HTTP 503"
        );
    }

    #[test]
    fn test_timeout_is_upstream_error() {
        let err = EngineError::timed_out("meeting history", 120);
        assert!(err.is_upstream());
        assert!(err.to_string().contains("timed out after 120s"));
    }

    #[test]
    fn test_configuration_error_is_not_upstream() {
        let err = EngineError::Configuration("bad working hours".to_string());
        assert!(!err.is_upstream());
    }
}
