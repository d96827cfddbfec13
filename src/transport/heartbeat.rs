//! Application-level ping loop.
//!
//! At most one loop runs per monitor: `start` always aborts the previous
//! task first. The loop also ends by itself once the sink reports the
//! socket gone.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::subscriptions::FrameSink;
use crate::transport::wire::OutboundFrame;

pub struct LivenessMonitor {
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: None,
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, sink: Arc<dyn FrameSink>) {
        self.stop();
        if self.interval.is_zero() {
            debug!("heartbeat disabled");
            return;
        }

        let period = self.interval;
        self.task = Some(tokio::spawn(async move {
            // First ping one period after open, not immediately
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !sink.send_frame(OutboundFrame::ping()) {
                    debug!("heartbeat sink closed, stopping");
                    break;
                }
                trace!("💓 ping");
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct CountingSink {
        closed: AtomicBool,
        frames: Mutex<Vec<String>>,
    }

    impl FrameSink for CountingSink {
        fn send_frame(&self, frame: OutboundFrame) -> bool {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            self.frames.lock().push(frame.msg_type().to_string());
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_every_interval() {
        let sink = Arc::new(CountingSink::default());
        let mut monitor = LivenessMonitor::new(Duration::from_secs(30));
        monitor.start(sink.clone());

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(*sink.frames.lock(), vec!["ping", "ping", "ping"]);

        monitor.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sink.frames.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_leaves_single_loop() {
        let sink = Arc::new(CountingSink::default());
        let mut monitor = LivenessMonitor::new(Duration::from_secs(10));
        monitor.start(sink.clone());
        monitor.start(sink.clone());
        monitor.start(sink.clone());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(sink.frames.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ends_when_sink_closes() {
        let sink = Arc::new(CountingSink::default());
        let mut monitor = LivenessMonitor::new(Duration::from_secs(5));
        monitor.start(sink.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        sink.closed.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(6)).await;

        // a sink that comes back does not revive the ended loop
        sink.closed.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.frames.lock().len(), 1);
        drop(monitor);
    }
}
