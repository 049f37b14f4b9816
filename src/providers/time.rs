use std::time::{Duration, Instant};

use super::rusage::{cpu_times, CpuTimes};
use crate::{
    config::TrackedProcess,
    measure::Measure,
    provider::{Interval, Provider, ProviderError, ProviderId},
    result::Results,
};

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Wall clock, user and system time.
///
/// Instantaneous reads report the CPU time consumed since the process started; wall
/// clock time is only meaningful over an interval. When tracking a child, user and
/// system time are those of the children waited for during the interval.
#[derive(Debug, Default)]
pub struct TimeProvider {
    process: TrackedProcess,
}

impl TimeProvider {
    pub fn new(process: TrackedProcess) -> Self {
        Self { process }
    }
}

impl Provider for TimeProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Time
    }

    fn fetch(&self, measures: &[Measure]) -> Results {
        let mut results = Results::new();
        let times = cpu_times(self.process);
        for measure in measures {
            match (measure, &times) {
                (Measure::TimeElapsedUserMs, Ok(t)) => results.insert(*measure, millis(t.user)),
                (Measure::TimeElapsedSystemMs, Ok(t)) => results.insert(*measure, millis(t.system)),
                (Measure::TimeElapsedUserMs | Measure::TimeElapsedSystemMs, Err(e)) => {
                    log::warn!("could not read {measure}: {e}")
                }
                (Measure::TimeElapsedWallClockMs, _) => {
                    log::debug!("{measure} requires an interval, skipping instantaneous read")
                }
                _ => {}
            }
        }
        results
    }

    fn begin(&self, _measures: &[Measure]) -> Result<Box<dyn Interval>, ProviderError> {
        let cpu = cpu_times(self.process)
            .map_err(|e| log::warn!("process CPU times unavailable: {e}"))
            .ok();
        Ok(Box::new(TimeInterval {
            process: self.process,
            started: Instant::now(),
            cpu,
        }))
    }
}

struct TimeInterval {
    process: TrackedProcess,
    started: Instant,
    cpu: Option<CpuTimes>,
}

impl Interval for TimeInterval {
    fn end(self: Box<Self>) -> Results {
        let wall = self.started.elapsed();
        let mut results = Results::new();
        results.insert(Measure::TimeElapsedWallClockMs, millis(wall));

        if let Some(start) = self.cpu {
            match cpu_times(self.process) {
                Ok(end) => {
                    let spent = end.since(start);
                    results.insert(Measure::TimeElapsedUserMs, millis(spent.user));
                    results.insert(Measure::TimeElapsedSystemMs, millis(spent.system));
                }
                Err(e) => log::warn!("could not read process CPU times: {e}"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::ResultType;

    #[test]
    fn wall_clock_covers_the_interval() {
        let interval = TimeProvider::default()
            .begin(&[Measure::TimeElapsedWallClockMs])
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let results = interval.end();

        let entry = results.get(Measure::TimeElapsedWallClockMs).unwrap();
        assert_eq!(entry.result_type, ResultType::Floating);
        assert!(entry.as_f64().unwrap() >= 100.0);
    }

    #[test]
    #[cfg(unix)]
    fn cpu_time_grows_with_busy_work() {
        let interval = TimeProvider::default().begin(&[Measure::TimeElapsedUserMs]).unwrap();
        let busy_until = Instant::now() + Duration::from_millis(50);
        let mut x = 0_u64;
        while Instant::now() < busy_until {
            x = std::hint::black_box(x.wrapping_add(1));
        }
        let results = interval.end();
        let user = results.get(Measure::TimeElapsedUserMs).unwrap().as_f64().unwrap();
        let system = results.get(Measure::TimeElapsedSystemMs).unwrap().as_f64().unwrap();
        assert!(user + system > 0.0);
    }

    #[test]
    #[cfg(unix)]
    fn busy_child_time_is_reported() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done"])
            .spawn()
            .unwrap();
        let provider = TimeProvider::new(TrackedProcess::Child(child.id()));
        let interval = provider.begin(&[Measure::TimeElapsedUserMs]).unwrap();
        assert!(child.wait().unwrap().success());
        let results = interval.end();

        let user = results.get(Measure::TimeElapsedUserMs).unwrap().as_f64().unwrap();
        assert!(user > 0.0);
    }

    #[test]
    fn wall_clock_is_not_read_instantaneously() {
        let results = TimeProvider::default().fetch(&[Measure::TimeElapsedWallClockMs]);
        assert!(!results.contains(Measure::TimeElapsedWallClockMs));
    }
}
