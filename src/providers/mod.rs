//! Built-in providers.

pub mod cpu;
pub mod energy;
pub mod git;
pub mod gpu;
pub mod memory;
pub mod os;
pub(crate) mod rusage;
pub(crate) mod sampler;
pub mod time;

use crate::{config::TrackerConfig, provider::Provider, provider::ProviderId};

pub use cpu::CpuProvider;
pub use energy::EnergyProvider;
pub use git::GitProvider;
pub use gpu::GpuProvider;
pub use memory::MemoryProvider;
pub use os::OsProvider;
pub use time::TimeProvider;

/// Instantiates the built-in provider for each of `enabled`.
pub(crate) fn builtin(config: &TrackerConfig, enabled: &[ProviderId]) -> Vec<Box<dyn Provider>> {
    enabled
        .iter()
        .map(|id| -> Box<dyn Provider> {
            let (poll, process) = (config.poll_interval(), config.process);
            match id {
                ProviderId::Os => Box::new(OsProvider),
                ProviderId::Time => Box::new(TimeProvider::new(process)),
                ProviderId::Cpu => Box::new(CpuProvider::new(process)),
                ProviderId::Memory => Box::new(MemoryProvider::new(poll, process)),
                ProviderId::Energy => Box::new(EnergyProvider::default()),
                ProviderId::Gpu => Box::new(GpuProvider::new(poll, process)),
                ProviderId::Git => Box::new(GitProvider::new(config.git_dir.clone())),
            }
        })
        .collect()
}
