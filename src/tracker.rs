use std::{collections::BTreeMap, convert::Infallible, fmt, sync::OnceLock, time::Instant};

use crate::{
    config::TrackerConfig,
    error::{Error, TrackError},
    measure::Measure,
    provider::{Provider, ProviderId},
    providers,
    result::Results,
    session::{SessionInfo, SessionRef, SessionState, SessionTable, TrackingSession},
};

/// Resolves measures to providers and runs tracking sessions over them.
///
/// A tracker is safe to share between threads; every session it hands out is independent
/// of the others, including sessions tracking the same measures.
pub struct Tracker {
    providers: BTreeMap<ProviderId, Box<dyn Provider>>,
    sessions: SessionTable,
    config: TrackerConfig,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("live_sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Tracker {
    /// A tracker with the built-in providers selected by `config`.
    pub fn new(config: TrackerConfig) -> Result<Self, Error> {
        let enabled = config.enabled_providers()?;
        let providers = providers::builtin(&config, &enabled);
        Ok(Self::with_providers(config, providers))
    }

    /// A tracker backed by the given providers. Measures whose provider is absent are
    /// never reported.
    pub fn with_providers(config: TrackerConfig, providers: Vec<Box<dyn Provider>>) -> Self {
        let providers = providers.into_iter().map(|p| (p.id(), p)).collect();
        Self {
            providers,
            sessions: SessionTable::new(),
            config,
        }
    }

    /// The process-wide tracker, configured from the environment on first use.
    pub fn global() -> &'static Tracker {
        static GLOBAL: OnceLock<Tracker> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Tracker::new(TrackerConfig::from_env()).unwrap_or_else(|e| {
                log::warn!("{e}; enabling all providers");
                let config = TrackerConfig {
                    providers: Vec::new(),
                    ..TrackerConfig::from_env()
                };
                let providers = providers::builtin(&config, ProviderId::ALL);
                Tracker::with_providers(config, providers)
            })
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Reads the measures once, without an interval.
    pub fn fetch_info(&self, measures: &[Measure]) -> Result<Results, Error> {
        let measures = validate(measures)?;
        let mut results = Results::new();
        for (provider, subset) in self.partition(&measures) {
            results.merge(read(provider, &subset));
        }
        Ok(results)
    }

    /// Begins tracking the measures and returns the reference to stop the session with.
    pub fn start_tracking(&self, measures: &[Measure]) -> Result<SessionRef, Error> {
        let measures = validate(measures)?;
        let mut session = TrackingSession::new(measures.clone());

        for (provider, subset) in self.partition(&measures) {
            let id = provider.id();
            if !id.info().continuous {
                session.deferred.push((id, subset));
                continue;
            }
            match provider.begin(&subset) {
                Ok(interval) => session.intervals.push((id, subset, interval)),
                Err(e) => {
                    log::warn!("{id}: {e}; reading its measures at stop instead");
                    session.deferred.push((id, subset));
                }
            }
        }

        let reference = self.sessions.register(session);
        log::debug!("started session {reference} tracking {} measure(s)", measures.len());
        Ok(reference)
    }

    /// Ends the session and returns what it measured. A reference can be stopped only once.
    pub fn stop_tracking(&self, reference: SessionRef) -> Result<Results, Error> {
        let mut session = self.sessions.take(reference)?;
        let stopping = Instant::now();
        let mut results = Results::new();

        // Intervals end in reverse begin order, so time is ended first.
        while let Some((id, subset, interval)) = session.intervals.pop() {
            let mut contribution = interval.end();
            contribution.restrict_to(&subset);
            log::trace!("{id} contributed {} measure(s)", contribution.len());
            results.merge(contribution);
        }
        for (id, subset) in session.deferred.drain(..) {
            if let Some(provider) = self.providers.get(&id) {
                results.merge(read(provider.as_ref(), &subset));
            }
        }
        log::trace!("session {reference}: {:?} -> {:?}", session.state, SessionState::Stopped);

        log::debug!(
            "stopped session {reference} in {:?}: {} of {} measure(s) read",
            stopping.elapsed(),
            results.len(),
            session.measures.len()
        );
        Ok(results)
    }

    /// Tracks the measures while `work` runs.
    ///
    /// The session is stopped however `work` exits; if it panics, the panic resumes
    /// after the session has been stopped.
    pub fn track<R>(&self, measures: &[Measure], work: impl FnOnce() -> R) -> Result<(Results, R), Error> {
        self.try_track(measures, || Ok::<_, Infallible>(work()))
            .map_err(|e| match e {
                TrackError::Tracker(e) => e,
                TrackError::Work(never) => match never {},
            })
    }

    /// Tracks the measures while fallible `work` runs.
    ///
    /// When `work` fails the session is still stopped, its results are discarded and the
    /// failure is returned as [`TrackError::Work`].
    pub fn try_track<R, E>(
        &self,
        measures: &[Measure],
        work: impl FnOnce() -> Result<R, E>,
    ) -> Result<(Results, R), TrackError<E>> {
        let guard = StopGuard {
            tracker: self,
            reference: Some(self.start_tracking(measures)?),
        };
        let outcome = work();
        let results = guard.stop()?;
        match outcome {
            Ok(value) => Ok((results, value)),
            Err(e) => Err(TrackError::Work(e)),
        }
    }

    pub fn live_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.snapshot()
    }

    /// Groups measures by their provider; measures of absent providers are dropped.
    fn partition(&self, measures: &[Measure]) -> Vec<(&dyn Provider, Vec<Measure>)> {
        let mut groups: BTreeMap<ProviderId, Vec<Measure>> = BTreeMap::new();
        for measure in measures {
            groups
                .entry(measure.info().provider)
                .or_default()
                .push(*measure);
        }

        let mut partitions: Vec<_> = groups
            .into_iter()
            .filter_map(|(id, subset)| match self.providers.get(&id) {
                Some(provider) => Some((provider.as_ref(), subset)),
                None => {
                    log::warn!("provider {id} is disabled; omitting {subset:?}");
                    None
                }
            })
            .collect();
        // Time begins last so it brackets the other providers as closely as possible.
        partitions.sort_by_key(|(provider, _)| provider.id() == ProviderId::Time);
        partitions
    }
}

fn validate(measures: &[Measure]) -> Result<Vec<Measure>, Error> {
    if measures.is_empty() {
        return Err(Error::EmptyRequest);
    }
    let mut measures = measures.to_vec();
    measures.sort_unstable();
    measures.dedup();
    Ok(measures)
}

fn read(provider: &dyn Provider, measures: &[Measure]) -> Results {
    let mut results = provider.fetch(measures);
    results.restrict_to(measures);
    results
}

/// Stops its session when dropped, unless it was stopped explicitly.
struct StopGuard<'a> {
    tracker: &'a Tracker,
    reference: Option<SessionRef>,
}

impl StopGuard<'_> {
    fn stop(mut self) -> Result<Results, Error> {
        match self.reference.take() {
            Some(reference) => self.tracker.stop_tracking(reference),
            None => Ok(Results::new()),
        }
    }
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if let Some(reference) = self.reference.take() {
            if std::thread::panicking() {
                log::warn!("tracked work panicked, stopping session {reference}");
            }
            if let Err(e) = self.tracker.stop_tracking(reference) {
                log::error!("failed to stop session {reference}: {e}");
            }
        }
    }
}
