use sysinfo::System;

use crate::{
    measure::Measure,
    provider::{Provider, ProviderError, ProviderId},
    result::Results,
};

/// Name and kernel of the running operating system.
#[derive(Debug, Default)]
pub struct OsProvider;

impl OsProvider {
    fn os_name() -> String {
        System::long_os_version()
            .or_else(|| match (System::name(), System::os_version()) {
                (Some(name), Some(version)) => Some(format!("{name} {version}")),
                (name, _) => name,
            })
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| std::env::consts::OS.to_string())
    }

    fn kernel() -> Result<String, ProviderError> {
        System::kernel_version()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ProviderError::Unavailable("kernel version is unknown".into()))
    }
}

impl Provider for OsProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Os
    }

    fn fetch(&self, measures: &[Measure]) -> Results {
        let mut results = Results::new();
        for measure in measures {
            match measure {
                Measure::OsName => results.insert(*measure, Self::os_name()),
                Measure::OsKernel => results.record(*measure, Self::kernel()),
                _ => {}
            }
        }
        results
    }
}
