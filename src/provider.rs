use std::{fmt::Display, sync::OnceLock};

use serde::{Deserialize, Serialize};

use crate::{measure::Measure, result::Results};

/// Identifies one of the built-in providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Os,
    Time,
    Cpu,
    Memory,
    Energy,
    Gpu,
    Git,
}

impl ProviderId {
    pub const ALL: &'static [ProviderId] = &[
        ProviderId::Os,
        ProviderId::Time,
        ProviderId::Cpu,
        ProviderId::Memory,
        ProviderId::Energy,
        ProviderId::Gpu,
        ProviderId::Git,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProviderId::Os => "os",
            ProviderId::Time => "time",
            ProviderId::Cpu => "cpu",
            ProviderId::Memory => "memory",
            ProviderId::Energy => "energy",
            ProviderId::Gpu => "gpu",
            ProviderId::Git => "git",
        }
    }

    fn description(self) -> &'static str {
        match self {
            ProviderId::Os => "Operating system name and kernel version.",
            ProviderId::Time => "Wall clock, user and system time elapsed while tracking.",
            ProviderId::Cpu => "CPU model, capabilities and utilization while tracking.",
            ProviderId::Memory => "Process and system RAM usage while tracking.",
            ProviderId::Energy => "CPU and DRAM energy consumption from RAPL counters.",
            ProviderId::Gpu => "NVIDIA GPU model, utilization, VRAM and energy via NVML.",
            ProviderId::Git => "State of the Git repository the experiment runs in.",
        }
    }

    fn version(self) -> &'static str {
        match self {
            ProviderId::Gpu if cfg!(feature = "nvml") => "nvml",
            ProviderId::Gpu => "unavailable",
            _ => env!("CARGO_PKG_VERSION"),
        }
    }

    /// Whether the provider samples over an interval (begin/end) instead of
    /// only answering instantaneous lookups.
    fn continuous(self) -> bool {
        match self {
            ProviderId::Os | ProviderId::Git => false,
            ProviderId::Time
            | ProviderId::Cpu
            | ProviderId::Memory
            | ProviderId::Energy
            | ProviderId::Gpu => true,
        }
    }

    /// Static description of this provider.
    pub fn info(self) -> &'static ProviderInfo {
        // the catalog follows declaration order
        &provider_infos()[self as usize]
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub id: ProviderId,
    pub description: &'static str,
    pub version: &'static str,
    pub measures: Vec<Measure>,
    pub continuous: bool,
}

/// All registered providers. Never empty.
pub fn provider_infos() -> &'static [ProviderInfo] {
    static INFOS: OnceLock<Vec<ProviderInfo>> = OnceLock::new();
    INFOS.get_or_init(|| {
        ProviderId::ALL
            .iter()
            .map(|id| ProviderInfo {
                id: *id,
                description: id.description(),
                version: id.version(),
                measures: Measure::ALL
                    .iter()
                    .copied()
                    .filter(|m| m.info().provider == *id)
                    .collect(),
                continuous: id.continuous(),
            })
            .collect()
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider {0} does not support interval sampling")]
    Unsupported(ProviderId),
    #[error("{0}")]
    Unavailable(String),
    #[error("failed to parse {what}: '{raw}'")]
    Parse { what: &'static str, raw: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A source of measure values.
///
/// Every provider answers instantaneous lookups through [`Provider::fetch`]. Providers
/// flagged as `continuous` in their [`ProviderInfo`] additionally open an interval
/// through [`Provider::begin`], whose state is closed by [`Interval::end`].
///
/// Providers report what they could read; measures they fail to read are left out of
/// the returned [`Results`].
pub trait Provider: Send + Sync {
    fn id(&self) -> ProviderId;

    fn fetch(&self, measures: &[Measure]) -> Results;

    fn begin(&self, _measures: &[Measure]) -> Result<Box<dyn Interval>, ProviderError> {
        Err(ProviderError::Unsupported(self.id()))
    }
}

/// Sampling state of an open interval, exclusively owned by the provider that opened it.
pub trait Interval: Send + Sync {
    fn end(self: Box<Self>) -> Results;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_measure_belongs_to_exactly_one_provider() {
        for measure in Measure::ALL {
            let owners = provider_infos()
                .iter()
                .filter(|p| p.measures.contains(measure))
                .count();
            assert_eq!(owners, 1, "{measure}");
        }
    }

    #[test]
    fn catalog_is_stable() {
        let first = provider_infos();
        let second = provider_infos();
        assert!(!first.is_empty());
        assert_eq!(first, second);
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn lookup_by_id() {
        for id in ProviderId::ALL {
            assert_eq!(id.info().id, *id);
            assert!(!id.info().measures.is_empty());
        }
        assert!(!ProviderId::Os.info().continuous);
        assert!(ProviderId::Time.info().continuous);
    }
}
