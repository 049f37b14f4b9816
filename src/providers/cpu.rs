use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use sysinfo::{Pid, System, MINIMUM_CPU_UPDATE_INTERVAL};

use super::rusage::{cpu_times, CpuTimes};
use crate::{
    config::TrackedProcess,
    measure::Measure,
    provider::{Interval, Provider, ProviderError, ProviderId},
    result::Results,
};

const PROC_CPUINFO: &str = "/proc/cpuinfo";
const SYSFS_CPU: &str = "/sys/devices/system/cpu";

/// Topology and capabilities parsed from `/proc/cpuinfo`.
#[derive(Debug, Default, PartialEq, Eq)]
struct CpuInfoFile {
    processors: usize,
    sockets: usize,
    physical_cores: usize,
    flags: Vec<String>,
}

impl CpuInfoFile {
    fn parse(content: &str) -> Self {
        let mut processors = 0;
        let mut sockets = BTreeSet::new();
        let mut cores = BTreeSet::new();
        let mut physical_id = String::new();
        let mut flags = Vec::new();

        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "processor" => processors += 1,
                "physical id" => {
                    physical_id = value.to_string();
                    sockets.insert(physical_id.clone());
                }
                "core id" => {
                    cores.insert((physical_id.clone(), value.to_string()));
                }
                // x86 names them flags, ARM features
                "flags" | "Features" if flags.is_empty() => {
                    flags = value.split_whitespace().map(str::to_string).collect();
                }
                _ => {}
            }
        }

        Self {
            processors,
            sockets: sockets.len(),
            physical_cores: cores.len(),
            flags,
        }
    }

    fn cores_per_socket(&self) -> Option<usize> {
        (self.sockets > 0 && self.physical_cores > 0).then(|| self.physical_cores / self.sockets)
    }

    fn threads_per_core(&self) -> Option<usize> {
        (self.physical_cores > 0).then(|| self.processors / self.physical_cores)
    }

    fn virtualization(&self) -> &'static str {
        if self.flags.iter().any(|f| f == "vmx") {
            "VT-x"
        } else if self.flags.iter().any(|f| f == "svm") {
            "AMD-V"
        } else {
            "none"
        }
    }
}

/// Parses sysfs cache sizes such as `48K` or `2M` into kibibytes.
fn parse_cache_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(k) = raw.strip_suffix('K') {
        k.parse().ok()
    } else if let Some(m) = raw.strip_suffix('M') {
        m.parse::<u64>().ok().map(|m| m * 1024)
    } else {
        raw.parse::<u64>().ok().map(|bytes| bytes / 1024)
    }
}

fn read_trimmed(path: &Path) -> Result<String, ProviderError> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

fn parse_u64(what: &'static str, raw: &str) -> Result<u64, ProviderError> {
    raw.trim().parse().map_err(|_| ProviderError::Parse {
        what,
        raw: raw.to_string(),
    })
}

/// CPU model, topology, capabilities and utilization.
#[derive(Debug, Clone)]
pub struct CpuProvider {
    cpuinfo: PathBuf,
    sysfs: PathBuf,
    process: TrackedProcess,
}

impl Default for CpuProvider {
    fn default() -> Self {
        Self::new(TrackedProcess::Current)
    }
}

impl CpuProvider {
    pub fn new(process: TrackedProcess) -> Self {
        Self {
            cpuinfo: PathBuf::from(PROC_CPUINFO),
            sysfs: PathBuf::from(SYSFS_CPU),
            process,
        }
    }

    #[cfg(test)]
    fn with_paths(cpuinfo: impl Into<PathBuf>, sysfs: impl Into<PathBuf>) -> Self {
        Self {
            cpuinfo: cpuinfo.into(),
            sysfs: sysfs.into(),
            process: TrackedProcess::Current,
        }
    }

    fn cpuinfo(&self) -> Result<CpuInfoFile, ProviderError> {
        Ok(CpuInfoFile::parse(&fs::read_to_string(&self.cpuinfo)?))
    }

    fn frequency_limit_mhz(&self, file: &str) -> Result<u64, ProviderError> {
        let raw = read_trimmed(&self.sysfs.join("cpu0/cpufreq").join(file))?;
        Ok(parse_u64("cpu frequency", &raw)? / 1000)
    }

    /// Sizes of the caches of the first CPU, e.g. `{"l1d": "48 KiB", "l2": "2048 KiB"}`.
    fn caches(&self) -> Result<String, ProviderError> {
        let mut caches = BTreeMap::new();
        for entry in fs::read_dir(self.sysfs.join("cpu0/cache"))? {
            let path = entry?.path();
            let is_index = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("index"));
            if !is_index {
                continue;
            }
            let level = read_trimmed(&path.join("level"))?;
            let kind = read_trimmed(&path.join("type"))?;
            let raw_size = read_trimmed(&path.join("size"))?;
            let size = parse_cache_size(&raw_size).ok_or(ProviderError::Parse {
                what: "cache size",
                raw: raw_size,
            })?;
            let name = match kind.as_str() {
                "Data" => format!("l{level}d"),
                "Instruction" => format!("l{level}i"),
                _ => format!("l{level}"),
            };
            caches.insert(name, format!("{size} KiB"));
        }
        if caches.is_empty() {
            return Err(ProviderError::Unavailable("no CPU caches listed".into()));
        }
        serde_json::to_string(&caches).map_err(|e| ProviderError::Unavailable(e.to_string()))
    }

    /// Reads everything that does not depend on an interval.
    fn read_static(&self, measures: &[Measure], results: &mut Results) {
        let mut system = System::new();
        system.refresh_cpu();
        let first = system.cpus().first();
        let cpuinfo = match self.cpuinfo() {
            Ok(info) => Some(info),
            Err(e) => {
                log::debug!("cannot read {}: {e}", self.cpuinfo.display());
                None
            }
        };
        let from_cpuinfo = |what: &str| ProviderError::Unavailable(format!("{what} is unknown"));

        for measure in measures {
            match measure {
                Measure::CpuAvailableSystemCores => {
                    results.insert(*measure, system.cpus().len());
                }
                Measure::CpuFeatures => results.record(
                    *measure,
                    cpuinfo
                        .as_ref()
                        .filter(|i| !i.flags.is_empty())
                        .map(|i| i.flags.join(" "))
                        .ok_or_else(|| from_cpuinfo("cpu feature list")),
                ),
                Measure::CpuFrequencyMhz => results.record(
                    *measure,
                    first
                        .map(|c| c.frequency())
                        .filter(|f| *f > 0)
                        .ok_or_else(|| from_cpuinfo("cpu frequency")),
                ),
                Measure::CpuFrequencyMinMhz => {
                    results.record(*measure, self.frequency_limit_mhz("cpuinfo_min_freq"))
                }
                Measure::CpuFrequencyMaxMhz => {
                    results.record(*measure, self.frequency_limit_mhz("cpuinfo_max_freq"))
                }
                Measure::CpuVendorId => results.record(
                    *measure,
                    first
                        .map(|c| c.vendor_id().trim().to_string())
                        .ok_or_else(|| from_cpuinfo("cpu vendor")),
                ),
                Measure::CpuByteOrder => {
                    let order = if cfg!(target_endian = "little") {
                        "Little Endian"
                    } else {
                        "Big Endian"
                    };
                    results.insert(*measure, order);
                }
                Measure::CpuArchitecture => results.insert(*measure, std::env::consts::ARCH),
                Measure::CpuModelName => results.record(
                    *measure,
                    first
                        .map(|c| c.brand().trim().to_string())
                        .ok_or_else(|| from_cpuinfo("cpu model")),
                ),
                Measure::CpuCoresPerSocket => results.record(
                    *measure,
                    cpuinfo
                        .as_ref()
                        .and_then(CpuInfoFile::cores_per_socket)
                        .ok_or_else(|| from_cpuinfo("cores per socket")),
                ),
                Measure::CpuThreadsPerCore => results.record(
                    *measure,
                    cpuinfo
                        .as_ref()
                        .and_then(CpuInfoFile::threads_per_core)
                        .ok_or_else(|| from_cpuinfo("threads per core")),
                ),
                Measure::CpuCaches => results.record(*measure, self.caches()),
                Measure::CpuVirtualization => results.record(
                    *measure,
                    cpuinfo
                        .as_ref()
                        .map(CpuInfoFile::virtualization)
                        .ok_or_else(|| from_cpuinfo("virtualization support")),
                ),
                _ => {}
            }
        }
    }
}

fn wants_usage(measures: &[Measure]) -> bool {
    measures
        .iter()
        .any(|m| matches!(m, Measure::CpuUsedProcessPercent | Measure::CpuUsedSystemPercent))
}

/// Where the process share of the CPU comes from.
enum ProcessUsage {
    /// Sampled by sysinfo.
    Sampled(Pid),
    /// Derived from the CPU time of the children waited for since the start.
    Children(CpuTimes),
}

impl ProcessUsage {
    fn start(process: TrackedProcess) -> Option<Self> {
        match process {
            TrackedProcess::Current => sysinfo::get_current_pid()
                .map_err(|e| log::warn!("cannot determine own pid: {e}"))
                .ok()
                .map(ProcessUsage::Sampled),
            TrackedProcess::Child(pid) => match cpu_times(process) {
                Ok(times) => Some(ProcessUsage::Children(times)),
                Err(e) => {
                    log::debug!("child CPU times unavailable ({e}), sampling pid {pid}");
                    Some(ProcessUsage::Sampled(Pid::from_u32(pid)))
                }
            },
        }
    }
}

/// Two-point CPU usage measurement over an interval.
struct UsageProbe {
    system: System,
    target: TrackedProcess,
    process: Option<ProcessUsage>,
    since: Instant,
}

impl UsageProbe {
    fn start(target: TrackedProcess) -> Self {
        let mut system = System::new();
        let process = ProcessUsage::start(target);
        system.refresh_cpu();
        if let Some(ProcessUsage::Sampled(pid)) = process {
            system.refresh_process(pid);
        }
        Self {
            system,
            target,
            process,
            since: Instant::now(),
        }
    }

    fn process_percent(&mut self, wall: Duration) -> Result<f64, ProviderError> {
        match self.process {
            Some(ProcessUsage::Sampled(pid)) => {
                if !self.system.refresh_process(pid) {
                    return Err(ProviderError::Unavailable(format!("process {pid} not found")));
                }
                self.system
                    .process(pid)
                    .map(|p| f64::from(p.cpu_usage()))
                    .ok_or_else(|| ProviderError::Unavailable(format!("process {pid} not found")))
            }
            Some(ProcessUsage::Children(start)) => {
                if wall.is_zero() {
                    return Err(ProviderError::Unavailable("empty interval".into()));
                }
                let spent = cpu_times(self.target)?.since(start);
                Ok(spent.total().as_secs_f64() / wall.as_secs_f64() * 100.0)
            }
            None => Err(ProviderError::Unavailable("tracked process unknown".into())),
        }
    }

    fn finish(mut self, measures: &[Measure], results: &mut Results) {
        let wall = self.since.elapsed();
        // sysinfo needs some time between refreshes to compute a meaningful usage
        if wall < MINIMUM_CPU_UPDATE_INTERVAL {
            std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL - wall);
        }
        self.system.refresh_cpu();

        for measure in measures {
            match measure {
                Measure::CpuUsedSystemPercent => {
                    results.insert(*measure, self.system.global_cpu_info().cpu_usage())
                }
                Measure::CpuUsedProcessPercent => {
                    let percent = self.process_percent(wall);
                    results.record(*measure, percent)
                }
                _ => {}
            }
        }
    }
}

impl Provider for CpuProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Cpu
    }

    fn fetch(&self, measures: &[Measure]) -> Results {
        let mut results = Results::new();
        if wants_usage(measures) {
            UsageProbe::start(self.process).finish(measures, &mut results);
        }
        self.read_static(measures, &mut results);
        results
    }

    fn begin(&self, measures: &[Measure]) -> Result<Box<dyn Interval>, ProviderError> {
        Ok(Box::new(CpuInterval {
            provider: self.clone(),
            measures: measures.to_vec(),
            usage: wants_usage(measures).then(|| UsageProbe::start(self.process)),
        }))
    }
}

struct CpuInterval {
    provider: CpuProvider,
    measures: Vec<Measure>,
    usage: Option<UsageProbe>,
}

impl Interval for CpuInterval {
    fn end(self: Box<Self>) -> Results {
        let mut results = Results::new();
        if let Some(usage) = self.usage {
            usage.finish(&self.measures, &mut results);
        }
        self.provider.read_static(&self.measures, &mut results);
        results
    }
}
