//! Tracks the hardware, software and resource consumption of computational experiments.
//!
//! Measures are read once with [`fetch_info`], or over a span of work with
//! [`start_tracking`]/[`stop_tracking`] and their scoped form [`track`]:
//!
//! ```no_run
//! use tirex_tracker::Measure;
//!
//! let (results, sum) = tirex_tracker::track(
//!     &[Measure::TimeElapsedWallClockMs, Measure::RamUsedProcessKb],
//!     || (0..1_000_000_u64).sum::<u64>(),
//! )?;
//! println!("{sum}\n{}", results.to_json());
//! # Ok::<(), tirex_tracker::Error>(())
//! ```

pub mod config;
mod error;
pub mod format;
mod measure;
mod provider;
pub mod providers;
mod result;
mod session;
mod tracker;

pub use config::{TrackedProcess, TrackerConfig};
pub use error::{Error, TrackError};
pub use measure::{measure_infos, Measure, MeasureInfo, ResultType};
pub use provider::{provider_infos, Interval, Provider, ProviderError, ProviderId, ProviderInfo};
pub use result::{ResultEntry, Results, Value};
pub use session::{SessionInfo, SessionRef, SessionState};
pub use tracker::Tracker;

/// Reads the measures once on the [global](Tracker::global) tracker.
pub fn fetch_info(measures: &[Measure]) -> Result<Results, Error> {
    Tracker::global().fetch_info(measures)
}

/// Starts a session on the [global](Tracker::global) tracker.
pub fn start_tracking(measures: &[Measure]) -> Result<SessionRef, Error> {
    Tracker::global().start_tracking(measures)
}

/// Stops a session of the [global](Tracker::global) tracker.
pub fn stop_tracking(reference: SessionRef) -> Result<Results, Error> {
    Tracker::global().stop_tracking(reference)
}

/// Tracks the measures while `work` runs, see [`Tracker::track`].
pub fn track<R>(measures: &[Measure], work: impl FnOnce() -> R) -> Result<(Results, R), Error> {
    Tracker::global().track(measures, work)
}

/// Tracks the measures while fallible `work` runs, see [`Tracker::try_track`].
pub fn try_track<R, E>(
    measures: &[Measure],
    work: impl FnOnce() -> Result<R, E>,
) -> Result<(Results, R), TrackError<E>> {
    Tracker::global().try_track(measures, work)
}
