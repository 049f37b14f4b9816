use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    measure::Measure,
    provider::{Interval, Provider, ProviderError, ProviderId},
    result::Results,
};

const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";
const MICROJOULES_PER_JOULE: f64 = 1e6;

/// What a RAPL zone accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Domain {
    Package,
    Dram,
}

impl Domain {
    fn parse(name: &str) -> Option<Domain> {
        match name {
            "dram" => Some(Domain::Dram),
            _ if name.starts_with("package-") => Some(Domain::Package),
            _ => None,
        }
    }

    fn measure(self) -> Measure {
        match self {
            Domain::Package => Measure::CpuEnergySystemJoules,
            Domain::Dram => Measure::RamEnergySystemJoules,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PowerZone {
    domain: Domain,
    path: PathBuf,
}

impl PowerZone {
    fn read_counter(&self, file: &str) -> Result<u64, ProviderError> {
        let path = self.path.join(file);
        let raw = fs::read_to_string(&path)?;
        raw.trim().parse().map_err(|_| ProviderError::Parse {
            what: "powercap energy counter",
            raw,
        })
    }
}

/// Finds the package and dram zones below `root`, ignoring core, uncore and psys.
fn power_zones(root: &Path) -> Result<Vec<PowerZone>, ProviderError> {
    fn explore(dir: &Path, zones: &mut Vec<PowerZone>) -> Result<(), ProviderError> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_zone = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(POWER_ZONE_PREFIX));
            if !path.is_dir() || !is_zone {
                continue;
            }
            let name = fs::read_to_string(path.join("name"))?;
            if let Some(domain) = Domain::parse(name.trim()) {
                zones.push(PowerZone {
                    domain,
                    path: path.clone(),
                });
            }
            explore(&path, zones)?;
        }
        Ok(())
    }

    let mut zones = Vec::new();
    explore(root, &mut zones)?;
    zones.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(zones)
}

/// Difference between two readings of a counter that wraps after `max_value`.
///
/// It is impossible to know whether more than one overflow occurred. `None` if the
/// readings are inconsistent with `max_value`.
fn counter_diff(previous: u64, current: u64, max_value: u64) -> Option<u64> {
    if current < previous {
        max_value.checked_sub(previous)?.checked_add(current)?.checked_add(1)
    } else {
        Some(current - previous)
    }
}

/// CPU package and DRAM energy from the RAPL powercap interface.
///
/// Counters are cumulative, so energy is only reported over an interval.
#[derive(Debug)]
pub struct EnergyProvider {
    root: PathBuf,
}

impl Default for EnergyProvider {
    fn default() -> Self {
        Self::with_root(POWERCAP_RAPL_PATH)
    }
}

impl EnergyProvider {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Provider for EnergyProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Energy
    }

    fn fetch(&self, measures: &[Measure]) -> Results {
        if !measures.is_empty() {
            log::warn!("energy counters are cumulative, an interval is required to read {measures:?}");
        }
        Results::new()
    }

    fn begin(&self, measures: &[Measure]) -> Result<Box<dyn Interval>, ProviderError> {
        let mut counters = Vec::new();
        for zone in power_zones(&self.root)? {
            if !measures.contains(&zone.domain.measure()) {
                continue;
            }
            let max = zone.read_counter("max_energy_range_uj")?;
            let start = zone.read_counter("energy_uj")?;
            counters.push(ZoneCounter { zone, max, start });
        }
        if counters.is_empty() {
            return Err(ProviderError::Unavailable(format!(
                "no RAPL zone for {measures:?} under {}",
                self.root.display()
            )));
        }
        log::debug!("tracking {} RAPL zones", counters.len());
        Ok(Box::new(EnergyInterval { counters }))
    }
}

struct ZoneCounter {
    zone: PowerZone,
    max: u64,
    start: u64,
}

struct EnergyInterval {
    counters: Vec<ZoneCounter>,
}

impl Interval for EnergyInterval {
    fn end(self: Box<Self>) -> Results {
        let mut per_measure = Vec::<(Measure, u64)>::new();
        for counter in &self.counters {
            let end = match counter.zone.read_counter("energy_uj") {
                Ok(end) => end,
                Err(e) => {
                    log::warn!("could not read {}: {e}", counter.zone.path.display());
                    continue;
                }
            };
            let Some(diff) = counter_diff(counter.start, end, counter.max) else {
                log::warn!(
                    "skipping {}: counter went from {} to {end} but wraps at {}",
                    counter.zone.path.display(),
                    counter.start,
                    counter.max
                );
                continue;
            };
            let measure = counter.zone.domain.measure();
            // sum over sockets
            match per_measure.iter_mut().find(|(m, _)| *m == measure) {
                Some((_, total)) => *total = total.saturating_add(diff),
                None => per_measure.push((measure, diff)),
            }
        }

        let mut results = Results::new();
        for (measure, microjoules) in per_measure {
            results.insert(measure, microjoules as f64 / MICROJOULES_PER_JOULE);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: [Measure; 2] = [Measure::CpuEnergySystemJoules, Measure::RamEnergySystemJoules];

    fn write_zone(dir: &Path, name: &str, energy: u64, max: u64) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("name"), format!("{name}\n")).unwrap();
        fs::write(dir.join("energy_uj"), format!("{energy}\n")).unwrap();
        fs::write(dir.join("max_energy_range_uj"), format!("{max}\n")).unwrap();
    }

    #[test]
    fn corrects_wrap_around() {
        assert_eq!(counter_diff(10, 25, 100), Some(15));
        assert_eq!(counter_diff(90, 5, 100), Some(16));
        assert_eq!(counter_diff(90, 5, 0), None);
    }

    #[test]
    fn inconsistent_zone_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let pkg0 = root.path().join("intel-rapl:0");
        let pkg1 = root.path().join("intel-rapl:1");
        write_zone(&pkg0, "package-0", 1_000_000, 10_000_000);
        // no usable range, as on some virtualized hosts
        write_zone(&pkg1, "package-1", 500, 0);

        let interval = EnergyProvider::with_root(root.path())
            .begin(&[Measure::CpuEnergySystemJoules])
            .unwrap();
        fs::write(pkg0.join("energy_uj"), "2000000").unwrap();
        fs::write(pkg1.join("energy_uj"), "100").unwrap();
        let results = interval.end();

        let cpu = results.get(Measure::CpuEnergySystemJoules).unwrap().as_f64().unwrap();
        assert!((cpu - 1.0).abs() < 1e-9, "cpu = {cpu}");
    }

    #[test]
    fn discovers_package_and_dram_zones() {
        let root = tempfile::tempdir().unwrap();
        let pkg = root.path().join("intel-rapl:0");
        write_zone(&pkg, "package-0", 0, 1000);
        write_zone(&pkg.join("intel-rapl:0:0"), "core", 0, 1000);
        write_zone(&pkg.join("intel-rapl:0:1"), "dram", 0, 1000);
        write_zone(&root.path().join("intel-rapl:1"), "psys", 0, 1000);

        let zones = power_zones(root.path()).unwrap();
        let domains: Vec<_> = zones.iter().map(|z| z.domain).collect();
        assert_eq!(domains, vec![Domain::Package, Domain::Dram]);
    }

    #[test]
    fn energy_over_interval_sums_sockets() {
        let root = tempfile::tempdir().unwrap();
        let pkg0 = root.path().join("intel-rapl:0");
        let pkg1 = root.path().join("intel-rapl:1");
        let dram = pkg0.join("intel-rapl:0:0");
        write_zone(&pkg0, "package-0", 1_000_000, 10_000_000);
        write_zone(&pkg1, "package-1", 9_500_000, 10_000_000);
        write_zone(&dram, "dram", 200_000, 10_000_000);

        let provider = EnergyProvider::with_root(root.path());
        let interval = provider.begin(&BOTH).unwrap();
        fs::write(pkg0.join("energy_uj"), "3000000").unwrap();
        // wrapped around
        fs::write(pkg1.join("energy_uj"), "499999").unwrap();
        fs::write(dram.join("energy_uj"), "700000").unwrap();
        let results = interval.end();

        let cpu = results.get(Measure::CpuEnergySystemJoules).unwrap().as_f64().unwrap();
        let ram = results.get(Measure::RamEnergySystemJoules).unwrap().as_f64().unwrap();
        assert!((cpu - 3.0).abs() < 1e-9, "cpu = {cpu}");
        assert!((ram - 0.5).abs() < 1e-9, "ram = {ram}");
    }

    #[test]
    fn only_requested_domains_are_tracked() {
        let root = tempfile::tempdir().unwrap();
        let pkg = root.path().join("intel-rapl:0");
        write_zone(&pkg, "package-0", 0, 1000);
        write_zone(&pkg.join("intel-rapl:0:0"), "dram", 0, 1000);

        let interval = EnergyProvider::with_root(root.path())
            .begin(&[Measure::RamEnergySystemJoules])
            .unwrap();
        let results = interval.end();
        assert!(results.contains(Measure::RamEnergySystemJoules));
        assert!(!results.contains(Measure::CpuEnergySystemJoules));
    }

    #[test]
    fn missing_powercap_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let provider = EnergyProvider::with_root(root.path().join("absent"));
        assert!(provider.begin(&BOTH).is_err());
        assert!(provider.fetch(&BOTH).is_empty());
    }
}
