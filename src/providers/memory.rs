use std::time::Duration;

use sysinfo::{Pid, System};

use super::sampler::Sampler;
use crate::{
    config::TrackedProcess,
    measure::Measure,
    provider::{Interval, Provider, ProviderError, ProviderId},
    result::Results,
};

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// One reading of process and system memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Usage {
    process_kb: Option<u64>,
    system_mb: u64,
    total_mb: u64,
}

impl Usage {
    fn max(self, other: Usage) -> Usage {
        Usage {
            process_kb: match (self.process_kb, other.process_kb) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
            system_mb: self.system_mb.max(other.system_mb),
            total_mb: self.total_mb.max(other.total_mb),
        }
    }

    fn report(&self, measures: &[Measure], results: &mut Results) {
        for measure in measures {
            match measure {
                Measure::RamUsedProcessKb => results.record(
                    *measure,
                    self.process_kb
                        .ok_or_else(|| ProviderError::Unavailable("tracked process not found".into())),
                ),
                Measure::RamUsedSystemMb => results.insert(*measure, self.system_mb),
                Measure::RamAvailableSystemMb => results.insert(*measure, self.total_mb),
                _ => {}
            }
        }
    }
}

struct Probe {
    system: System,
    pid: Option<Pid>,
}

impl Probe {
    fn new(process: TrackedProcess) -> Self {
        let pid = match process {
            TrackedProcess::Current => sysinfo::get_current_pid()
                .map_err(|e| log::warn!("cannot determine own pid: {e}"))
                .ok(),
            TrackedProcess::Child(pid) => Some(Pid::from_u32(pid)),
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    fn read(&mut self) -> Usage {
        self.system.refresh_memory();
        let process_kb = self
            .pid
            .filter(|pid| self.system.refresh_process(*pid))
            .and_then(|pid| self.system.process(pid))
            .map(|p| p.memory() / KB);
        Usage {
            process_kb,
            system_mb: self.system.used_memory() / MB,
            total_mb: self.system.total_memory() / MB,
        }
    }
}

/// Process and system RAM usage. Over an interval the peak is reported.
#[derive(Debug)]
pub struct MemoryProvider {
    poll_interval: Duration,
    process: TrackedProcess,
}

impl MemoryProvider {
    pub fn new(poll_interval: Duration, process: TrackedProcess) -> Self {
        Self {
            poll_interval,
            process,
        }
    }
}

impl Provider for MemoryProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Memory
    }

    fn fetch(&self, measures: &[Measure]) -> Results {
        let mut results = Results::new();
        Probe::new(self.process).read().report(measures, &mut results);
        results
    }

    fn begin(&self, measures: &[Measure]) -> Result<Box<dyn Interval>, ProviderError> {
        let state = (Probe::new(self.process), Usage::default());
        let sampler = Sampler::spawn("memory", self.poll_interval, state, |(probe, peak)| {
            *peak = peak.max(probe.read());
        })?;
        Ok(Box::new(MemoryInterval {
            measures: measures.to_vec(),
            sampler,
        }))
    }
}

struct MemoryInterval {
    measures: Vec<Measure>,
    sampler: Sampler<(Probe, Usage)>,
}

impl Interval for MemoryInterval {
    fn end(self: Box<Self>) -> Results {
        let mut results = Results::new();
        match self.sampler.stop() {
            Some((_, peak)) => peak.report(&self.measures, &mut results),
            None => log::error!("memory sampler panicked, no memory usage recorded"),
        }
        results
    }
}
