use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

/// Background thread that polls a sampling function until stopped.
///
/// The state is sampled once when the thread starts, then every `interval`, and a last
/// time when [`Sampler::stop`] is called.
pub(crate) struct Sampler<T> {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Sampler<T> {
    pub(crate) fn spawn<F>(name: &str, interval: Duration, mut state: T, mut sample: F) -> io::Result<Self>
    where
        F: FnMut(&mut T) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let is_running = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(format!("tirex-{name}-sampler"))
            .spawn(move || {
                sample(&mut state);
                while is_running.load(Ordering::Acquire) {
                    std::thread::park_timeout(interval);
                    sample(&mut state);
                }
                state
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stops polling and returns the final state, or `None` if the sampling thread panicked.
    pub(crate) fn stop(mut self) -> Option<T> {
        self.running.store(false, Ordering::Release);
        let handle = self.handle.take()?;
        handle.thread().unpark();
        handle.join().ok()
    }
}

impl<T> Drop for Sampler<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn samples_until_stopped() {
        let sampler = Sampler::spawn("test", Duration::from_millis(5), 0_u32, |n| *n += 1).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let samples = sampler.stop().unwrap();
        // the initial sample, the final one and some in between
        assert!(samples >= 3, "only {samples} samples");
    }

    #[test]
    fn stop_does_not_wait_for_interval() {
        let sampler = Sampler::spawn("slow", Duration::from_secs(60), Vec::new(), |v: &mut Vec<u8>| {
            v.push(1)
        })
        .unwrap();
        let stopping = Instant::now();
        let samples = sampler.stop().unwrap();
        assert!(stopping.elapsed() < Duration::from_secs(10));
        assert!(!samples.is_empty());
    }

    #[test]
    fn panicking_sampler_yields_none() {
        let sampler = Sampler::spawn("panic", Duration::from_millis(1), (), |_| panic!("sampling failed"))
            .unwrap();
        assert!(sampler.stop().is_none());
    }
}
