use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// A background thread running a closure on a fixed period until stopped.
///
/// Stopping wakes the thread immediately rather than waiting out the period.
pub(crate) struct Ticker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn a thread named `name` calling `tick` every `period`. The thread
    /// also stops on its own when `tick` returns `false`.
    pub(crate) fn spawn<F>(name: &str, period: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock();
                let mut next = Instant::now() + period;
                while !*stopped {
                    if cvar.wait_until(&mut stopped, next).timed_out() {
                        next = (next + period).max(Instant::now());
                        if !MutexGuard::unlocked(&mut stopped, &mut tick) {
                            break;
                        }
                    }
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it. Idempotent.
    pub(crate) fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if handle.join().is_err() {
            tracing::warn!("background thread panicked");
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn ticks_until_stopped() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let mut ticker = Ticker::spawn("test-ticker", Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        let start = Instant::now();
        while count.load(Ordering::SeqCst) < 3 {
            assert!(start.elapsed() < Duration::from_secs(5), "ticker never fired");
            std::thread::sleep(Duration::from_millis(1));
        }
        ticker.stop();
        let after = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after);
    }

    #[test]
    fn stop_is_prompt() {
        let mut ticker = Ticker::spawn("slow-ticker", Duration::from_secs(3600), || true).unwrap();
        let start = Instant::now();
        ticker.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn tick_can_end_the_thread() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let ticker = Ticker::spawn("one-shot", Duration::from_millis(1), move || {
            c.fetch_add(1, Ordering::SeqCst);
            false
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        drop(ticker);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
