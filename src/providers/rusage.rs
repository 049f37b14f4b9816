use std::time::Duration;

use crate::{config::TrackedProcess, provider::ProviderError};

/// User and system CPU time consumed so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct CpuTimes {
    pub(crate) user: Duration,
    pub(crate) system: Duration,
}

impl CpuTimes {
    pub(crate) fn since(self, earlier: CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.saturating_sub(earlier.user),
            system: self.system.saturating_sub(earlier.system),
        }
    }

    pub(crate) fn total(self) -> Duration {
        self.user + self.system
    }
}

/// Reads the CPU times of `process`.
///
/// A child is accounted through `RUSAGE_CHILDREN`, which only covers children that
/// terminated and were waited for.
#[cfg(unix)]
pub(crate) fn cpu_times(process: TrackedProcess) -> Result<CpuTimes, ProviderError> {
    fn to_duration(tv: libc::timeval) -> Duration {
        let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
        let micros = u64::try_from(tv.tv_usec).unwrap_or(0);
        Duration::from_secs(secs) + Duration::from_micros(micros)
    }

    let who = match process {
        TrackedProcess::Current => libc::RUSAGE_SELF,
        TrackedProcess::Child(_) => libc::RUSAGE_CHILDREN,
    };
    // SAFETY: rusage is plain old data, all-zero is a valid value.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: the pointer is valid for writes for the duration of the call.
    let ret = unsafe { libc::getrusage(who, &mut usage) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(CpuTimes {
        user: to_duration(usage.ru_utime),
        system: to_duration(usage.ru_stime),
    })
}

#[cfg(not(unix))]
pub(crate) fn cpu_times(_process: TrackedProcess) -> Result<CpuTimes, ProviderError> {
    Err(ProviderError::Unavailable(
        "process CPU times are only supported on unix".into(),
    ))
}
