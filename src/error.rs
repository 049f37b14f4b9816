use std::path::PathBuf;

use crate::session::SessionRef;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("at least one measure must be requested")]
    EmptyRequest,
    #[error("invalid measure: {0}")]
    InvalidMeasure(String),
    #[error("unknown session {0}: it was never started or is already stopped")]
    UnknownSession(SessionRef),
    #[error("invalid provider filter '{pattern}'")]
    ProviderFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to parse config file {}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of [`Tracker::try_track`](crate::Tracker::try_track) when no results are returned.
#[derive(Debug, thiserror::Error)]
pub enum TrackError<E> {
    /// The tracking request itself was invalid; the work was not run.
    #[error(transparent)]
    Tracker(#[from] Error),
    /// The work failed. The session was stopped and its results discarded.
    #[error("tracked work failed: {0}")]
    Work(E),
}

impl<E> TrackError<E> {
    pub fn into_work_error(self) -> Option<E> {
        match self {
            TrackError::Work(e) => Some(e),
            TrackError::Tracker(_) => None,
        }
    }
}
