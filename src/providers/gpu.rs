use std::time::Duration;

use crate::{
    config::TrackedProcess,
    measure::Measure,
    provider::{Interval, Provider, ProviderError, ProviderId},
    result::Results,
};

/// One reading over all devices.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(not(feature = "nvml"), allow(dead_code))]
struct GpuSample {
    system_percent: f64,
    process_percent: f64,
    vram_system_mb: u64,
    vram_process_mb: u64,
}

/// Utilization averaged and VRAM peaked over several samples.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(not(feature = "nvml"), allow(dead_code))]
struct Utilization {
    samples: u32,
    system_percent_sum: f64,
    process_percent_sum: f64,
    peak_vram_system_mb: u64,
    peak_vram_process_mb: u64,
}

#[cfg_attr(not(feature = "nvml"), allow(dead_code))]
impl Utilization {
    fn add(&mut self, sample: GpuSample) {
        self.samples += 1;
        self.system_percent_sum += sample.system_percent;
        self.process_percent_sum += sample.process_percent;
        self.peak_vram_system_mb = self.peak_vram_system_mb.max(sample.vram_system_mb);
        self.peak_vram_process_mb = self.peak_vram_process_mb.max(sample.vram_process_mb);
    }

    fn report(&self, measures: &[Measure], results: &mut Results) {
        if self.samples == 0 {
            return;
        }
        let n = f64::from(self.samples);
        for measure in measures {
            match measure {
                Measure::GpuUsedSystemPercent => results.insert(*measure, self.system_percent_sum / n),
                Measure::GpuUsedProcessPercent => {
                    results.insert(*measure, self.process_percent_sum / n)
                }
                Measure::GpuVramUsedSystemMb => results.insert(*measure, self.peak_vram_system_mb),
                Measure::GpuVramUsedProcessMb => results.insert(*measure, self.peak_vram_process_mb),
                _ => {}
            }
        }
    }
}

fn report_unsupported(measures: &[Measure], results: &mut Results) {
    if measures.contains(&Measure::GpuSupported) {
        results.insert(Measure::GpuSupported, false);
    }
}

/// NVIDIA GPUs through NVML.
///
/// NVML is loaded on first use and shared by the whole process. Without the `nvml`
/// feature, or when no driver is installed, only `GPU_SUPPORTED = 0` is reported.
#[derive(Debug)]
#[cfg_attr(not(feature = "nvml"), allow(dead_code))]
pub struct GpuProvider {
    poll_interval: Duration,
    process: TrackedProcess,
}

impl GpuProvider {
    pub fn new(poll_interval: Duration, process: TrackedProcess) -> Self {
        Self {
            poll_interval,
            process,
        }
    }
}

#[cfg(not(feature = "nvml"))]
impl Provider for GpuProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gpu
    }

    fn fetch(&self, measures: &[Measure]) -> Results {
        let mut results = Results::new();
        report_unsupported(measures, &mut results);
        results
    }

    fn begin(&self, _measures: &[Measure]) -> Result<Box<dyn Interval>, ProviderError> {
        Err(ProviderError::Unsupported(ProviderId::Gpu))
    }
}

#[cfg(feature = "nvml")]
mod nvml {
    use std::sync::OnceLock;

    use nvml_wrapper::{enums::device::UsedGpuMemory, error::NvmlError, Device, Nvml};

    use super::*;
    use crate::providers::sampler::Sampler;

    const MB: u64 = 1_000_000;
    const MILLIJOULES_PER_JOULE: f64 = 1e3;

    pub(super) fn library() -> Option<&'static Nvml> {
        static NVML: OnceLock<Option<Nvml>> = OnceLock::new();
        NVML.get_or_init(|| match Nvml::init() {
            Ok(nvml) => {
                log::info!("NVML initialized");
                Some(nvml)
            }
            Err(e) => {
                log::debug!("NVML is not available: {e}");
                None
            }
        })
        .as_ref()
    }

    fn device_count(nvml: &Nvml) -> u32 {
        nvml.device_count().unwrap_or_else(|e| {
            log::warn!("cannot count GPU devices: {e}");
            0
        })
    }

    fn unavailable(e: NvmlError) -> ProviderError {
        ProviderError::Unavailable(e.to_string())
    }

    fn sum_over_devices(
        nvml: &Nvml,
        count: u32,
        read: impl Fn(&Device<'_>) -> Result<u64, NvmlError>,
    ) -> Result<u64, ProviderError> {
        let mut total = 0;
        for index in 0..count {
            let device = nvml.device_by_index(index).map_err(unavailable)?;
            total += read(&device).map_err(unavailable)?;
        }
        Ok(total)
    }

    /// Model, core count and VRAM size, which do not change over time.
    pub(super) fn read_static(nvml: &Nvml, measures: &[Measure], results: &mut Results) {
        let count = device_count(nvml);
        if count == 0 {
            report_unsupported(measures, results);
            return;
        }
        for measure in measures {
            match measure {
                Measure::GpuSupported => results.insert(*measure, true),
                Measure::GpuModelName => results.record(
                    *measure,
                    nvml.device_by_index(0).and_then(|d| d.name()).map_err(unavailable),
                ),
                Measure::GpuNumCores => results.record(
                    *measure,
                    sum_over_devices(nvml, count, |d| Ok(u64::from(d.num_cores()?))),
                ),
                Measure::GpuVramAvailableSystemMb => results.record(
                    *measure,
                    sum_over_devices(nvml, count, |d| Ok(d.memory_info()?.total / MB)),
                ),
                _ => {}
            }
        }
    }

    /// Reads utilization and memory of all devices, attributing to `pid` its share.
    /// `last_seen` is the newest process utilization timestamp already accounted for.
    pub(super) fn sample(nvml: &Nvml, pid: u32, last_seen: &mut u64) -> GpuSample {
        let count = device_count(nvml);
        let mut sample = GpuSample::default();

        for index in 0..count {
            let device = match nvml.device_by_index(index) {
                Ok(device) => device,
                Err(e) => {
                    log::warn!("cannot open GPU {index}: {e}");
                    continue;
                }
            };
            match device.utilization_rates() {
                Ok(u) => sample.system_percent += f64::from(u.gpu),
                Err(e) => log::debug!("GPU {index} utilization: {e}"),
            }
            match device.memory_info() {
                Ok(m) => sample.vram_system_mb += m.used / MB,
                Err(e) => log::debug!("GPU {index} memory: {e}"),
            }
            match device.running_compute_processes() {
                Ok(processes) => {
                    sample.vram_process_mb += processes
                        .iter()
                        .filter(|p| p.pid == pid)
                        .map(|p| match p.used_gpu_memory {
                            UsedGpuMemory::Used(bytes) => bytes / MB,
                            UsedGpuMemory::Unavailable => 0,
                        })
                        .sum::<u64>()
                }
                Err(e) => log::debug!("GPU {index} processes: {e}"),
            }
            match device.process_utilization_stats(*last_seen) {
                Ok(stats) => {
                    for s in stats.iter().filter(|s| s.pid == pid) {
                        sample.process_percent += f64::from(s.sm_util);
                    }
                    if let Some(newest) = stats.iter().map(|s| s.timestamp).max() {
                        *last_seen = (*last_seen).max(newest);
                    }
                }
                // no sample since last_seen
                Err(NvmlError::NotFound) => {}
                Err(e) => log::debug!("GPU {index} process utilization: {e}"),
            }
        }
        if count > 0 {
            sample.system_percent /= f64::from(count);
            sample.process_percent /= f64::from(count);
        }
        sample
    }

    /// Total energy counter of every device in millijoules, `None` where unsupported.
    fn energy_mj(nvml: &Nvml) -> Vec<Option<u64>> {
        (0..device_count(nvml))
            .map(|i| {
                nvml.device_by_index(i)
                    .and_then(|d| d.total_energy_consumption())
                    .map_err(|e| log::debug!("GPU {i} energy: {e}"))
                    .ok()
            })
            .collect()
    }

    pub(super) struct NvmlInterval {
        pub(super) nvml: &'static Nvml,
        pub(super) measures: Vec<Measure>,
        pub(super) energy_start: Vec<Option<u64>>,
        pub(super) sampler: Sampler<(Utilization, u64)>,
    }

    impl NvmlInterval {
        pub(super) fn start(
            nvml: &'static Nvml,
            measures: &[Measure],
            poll_interval: Duration,
            pid: u32,
        ) -> Result<Self, ProviderError> {
            let energy_start = energy_mj(nvml);
            let sampler = Sampler::spawn(
                "gpu",
                poll_interval,
                (Utilization::default(), 0_u64),
                move |(utilization, last_seen)| utilization.add(sample(nvml, pid, last_seen)),
            )?;
            Ok(Self {
                nvml,
                measures: measures.to_vec(),
                energy_start,
                sampler,
            })
        }
    }

    impl Interval for NvmlInterval {
        fn end(self: Box<Self>) -> Results {
            let mut results = Results::new();
            match self.sampler.stop() {
                Some((utilization, _)) => utilization.report(&self.measures, &mut results),
                None => log::error!("GPU sampler panicked, no utilization recorded"),
            }
            if self.measures.contains(&Measure::GpuEnergySystemJoules) {
                let consumed: Option<u64> = self
                    .energy_start
                    .iter()
                    .zip(energy_mj(self.nvml))
                    .map(|(start, end)| Some(end?.saturating_sub((*start)?)))
                    .sum();
                match consumed {
                    Some(mj) => results.insert(
                        Measure::GpuEnergySystemJoules,
                        mj as f64 / MILLIJOULES_PER_JOULE,
                    ),
                    None => log::warn!("GPU energy counters are not supported on every device"),
                }
            }
            read_static(self.nvml, &self.measures, &mut results);
            results
        }
    }
}

#[cfg(feature = "nvml")]
impl Provider for GpuProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gpu
    }

    fn fetch(&self, measures: &[Measure]) -> Results {
        let mut results = Results::new();
        match nvml::library() {
            Some(lib) => {
                let mut utilization = Utilization::default();
                utilization.add(nvml::sample(lib, self.process.pid(), &mut 0));
                utilization.report(measures, &mut results);
                nvml::read_static(lib, measures, &mut results);
            }
            None => report_unsupported(measures, &mut results),
        }
        results
    }

    fn begin(&self, measures: &[Measure]) -> Result<Box<dyn Interval>, ProviderError> {
        let lib = nvml::library()
            .ok_or_else(|| ProviderError::Unavailable("NVML could not be loaded".into()))?;
        let interval =
            nvml::NvmlInterval::start(lib, measures, self.poll_interval, self.process.pid())?;
        Ok(Box::new(interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_utilization_and_peaks_vram() {
        let mut u = Utilization::default();
        u.add(GpuSample {
            system_percent: 20.0,
            process_percent: 10.0,
            vram_system_mb: 1000,
            vram_process_mb: 200,
        });
        u.add(GpuSample {
            system_percent: 60.0,
            process_percent: 30.0,
            vram_system_mb: 800,
            vram_process_mb: 500,
        });

        let mut results = Results::new();
        u.report(
            &[
                Measure::GpuUsedSystemPercent,
                Measure::GpuUsedProcessPercent,
                Measure::GpuVramUsedSystemMb,
                Measure::GpuVramUsedProcessMb,
            ],
            &mut results,
        );
        assert_eq!(results.get(Measure::GpuUsedSystemPercent).unwrap().as_f64(), Some(40.0));
        assert_eq!(results.get(Measure::GpuUsedProcessPercent).unwrap().as_f64(), Some(20.0));
        assert_eq!(results.get(Measure::GpuVramUsedSystemMb).unwrap().as_i64(), Some(1000));
        assert_eq!(results.get(Measure::GpuVramUsedProcessMb).unwrap().as_i64(), Some(500));
    }

    #[test]
    fn no_samples_no_results() {
        let mut results = Results::new();
        Utilization::default().report(&[Measure::GpuUsedSystemPercent], &mut results);
        assert!(results.is_empty());
    }

    #[test]
    fn always_answers_whether_supported() {
        let provider = GpuProvider::new(Duration::from_millis(10), TrackedProcess::Current);
        let results = provider.fetch(&[Measure::GpuSupported]);
        let supported = results.get(Measure::GpuSupported).unwrap().as_i64().unwrap();
        assert!(supported == 0 || supported == 1);
    }

    #[test]
    #[cfg(not(feature = "nvml"))]
    fn intervals_need_nvml() {
        let provider = GpuProvider::new(Duration::from_millis(10), TrackedProcess::Current);
        assert!(matches!(
            provider.begin(&[Measure::GpuSupported]),
            Err(ProviderError::Unsupported(ProviderId::Gpu))
        ));
    }
}
