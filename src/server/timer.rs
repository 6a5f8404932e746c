//! Two cancellable periodic schedules: one for election timeouts, one for
//! heartbeats. A `Timer` owns a background thread that posts a message
//! into the node's main channel on every tick; `run()` is the single
//! place that tears one down and arms another, so role transitions that
//! cross-arm timers always go through it.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct Timer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// A timer that is off: no thread, nothing to disarm.
    pub fn disarmed() -> Timer {
        Timer { stop: None, handle: None }
    }

    /// Spawns a background thread that sends `make_message()` into `tx`
    /// after `initial_delay`, then every `interval` thereafter, until
    /// disarmed.
    pub fn arm<T: Send + 'static>(
        interval: Duration,
        initial_delay: Duration,
        tx: Sender<T>,
        make_message: impl Fn() -> T + Send + 'static,
    ) -> Timer {
        let (stop_tx, stop_rx) = channel::<()>();
        let handle = thread::spawn(move || {
            if !initial_delay.is_zero() {
                match stop_rx.recv_timeout(initial_delay) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
            loop {
                if tx.send(make_message()).is_err() {
                    return;
                }
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => continue,
                }
            }
        });
        Timer {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stops the background thread, if any, and waits for it to exit.
    pub fn disarm(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Default for Timer {
    fn default() -> Timer {
        Timer::disarmed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel as std_channel;

    #[test]
    fn fires_after_initial_delay_then_periodically() {
        let (tx, rx) = std_channel();
        let mut timer = Timer::arm(Duration::from_millis(10), Duration::from_millis(5), tx, || ());
        rx.recv_timeout(Duration::from_millis(200)).expect("first tick");
        rx.recv_timeout(Duration::from_millis(200)).expect("second tick");
        timer.disarm();
    }

    #[test]
    fn disarm_stops_further_ticks() {
        let (tx, rx) = std_channel();
        let mut timer = Timer::arm(Duration::from_millis(5), Duration::from_millis(0), tx, || ());
        rx.recv_timeout(Duration::from_millis(200)).expect("first tick");
        timer.disarm();
        // Drain anything already in flight, then make sure nothing new shows up.
        while rx.try_recv().is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn disarmed_timer_does_nothing() {
        let mut t = Timer::disarmed();
        t.disarm(); // no-op, must not panic
    }
}
