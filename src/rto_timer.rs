use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Receiver of timer events. Implementations must not hold locks across
/// calls into the timer itself; the timer tasks call these methods without
/// holding any connection state.
#[async_trait]
pub trait RtoTimerDelegate: Send + Sync + 'static {
    /// Fires when the retransmission timeout expires. `scheduled_rto` is the
    /// RTO value the timer was armed with, which is what decides whether a
    /// buffered message is due (the live RTO may already have changed).
    /// Implementations retransmit what is due and return the next RTO, or
    /// `None` once no unacknowledged data remains and the timer should stop.
    async fn rto_timeout(&self, now: Instant, scheduled_rto: Duration) -> Option<Duration>;

    /// The connection has been silent for the warning threshold.
    async fn connection_lost(&self);

    /// The connection has been silent for the full timeout.
    async fn connection_timeout(&self);
}

/// The retransmission/connection-timeout timer pair, reusable over a
/// delegate: the per-connection timer bundle uses it, and so does the NAT
/// punchthrough handshake (with the warning stage disabled).
///
/// All timers are one-shot tokio tasks; rescheduling aborts and respawns,
/// so a timer that fires after its owner descheduled it is a no-op.
pub struct RtoTimer {
    delegate: Arc<dyn RtoTimerDelegate>,

    /// `None` disables the connection-lost warning stage.
    warning_timeout: Option<Duration>,
    connection_timeout: Duration,
    initial_connection_timeout: Duration,
    connection_open: bool,
    issued_connection_warning: Arc<AtomicBool>,

    rto_handle: Option<JoinHandle<()>>,
    connection_handle: Option<JoinHandle<()>>,
}

impl RtoTimer {
    pub fn new(
        warning_timeout: Option<Duration>,
        connection_timeout: Duration,
        initial_connection_timeout: Duration,
        delegate: Arc<dyn RtoTimerDelegate>,
    ) -> RtoTimer {
        let mut timer = RtoTimer {
            delegate,
            warning_timeout,
            connection_timeout,
            initial_connection_timeout,
            connection_open: false,
            issued_connection_warning: Arc::new(AtomicBool::new(false)),
            rto_handle: None,
            connection_handle: None,
        };
        timer.reset_connection_timeout();
        timer
    }

    fn effective_connection_timeout(&self) -> Duration {
        if self.connection_open {
            self.connection_timeout
        }
        else {
            self.initial_connection_timeout
        }
    }

    fn reset_connection_timeout(&mut self) {
        if let Some(handle) = self.connection_handle.take() {
            handle.abort();
        }

        let connection_timeout = self.effective_connection_timeout();
        let warning_timeout = self
            .warning_timeout
            .filter(|&warning| warning < connection_timeout);

        let delegate = self.delegate.clone();
        let issued_warning = self.issued_connection_warning.clone();
        self.connection_handle = Some(tokio::spawn(async move {
            if let Some(warning_timeout) = warning_timeout {
                sleep(warning_timeout).await;
                issued_warning.store(true, Ordering::Relaxed);
                delegate.connection_lost().await;
                sleep(connection_timeout - warning_timeout).await;
            }
            else {
                sleep(connection_timeout).await;
            }
            delegate.connection_timeout().await;
        }));
    }

    /// Ensures the RTO timer is running. The delegate keeps it alive by
    /// returning the next RTO from each `rto_timeout` call.
    pub fn update_rto_timeout(&mut self, rto: Duration) {
        if self.rto_handle.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let delegate = self.delegate.clone();
        self.rto_handle = Some(tokio::spawn(async move {
            let mut rto = rto;
            loop {
                sleep(rto).await;
                match delegate.rto_timeout(Instant::now(), rto).await {
                    Some(next_rto) => rto = next_rto,
                    None => break,
                }
            }
        }));
    }

    /// Cancels the running RTO cycle and starts a fresh one, as used when
    /// RTT state is replaced wholesale (NAT punchthrough path switch).
    pub fn force_reset_rto_timer(&mut self, rto: Duration) {
        self.deschedule_rto();
        self.update_rto_timeout(rto);
    }

    pub fn deschedule_rto(&mut self) {
        if let Some(handle) = self.rto_handle.take() {
            handle.abort();
        }
    }

    /// Called for every received packet. Returns true if a connection-lost
    /// warning had been issued and the caller should report the connection
    /// as regained.
    #[must_use]
    pub fn got_packet(&mut self) -> bool {
        self.reset_connection_timeout();
        self.issued_connection_warning.swap(false, Ordering::Relaxed)
    }

    /// Switches from the initial to the regular connection timeout.
    pub fn connection_opened(&mut self) {
        self.connection_open = true;
    }

    pub fn deschedule(&mut self) {
        self.deschedule_rto();
        if let Some(handle) = self.connection_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for RtoTimer {
    fn drop(&mut self) {
        self.deschedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    struct RecordingDelegate {
        rto_timeouts: AtomicU32,
        /// RTOs to hand back, drained front to back; empty stops the timer.
        next_rtos: Mutex<Vec<Duration>>,
        lost: AtomicU32,
        timed_out: AtomicU32,
    }

    impl RecordingDelegate {
        fn new(next_rtos: Vec<Duration>) -> Arc<RecordingDelegate> {
            Arc::new(RecordingDelegate {
                rto_timeouts: AtomicU32::new(0),
                next_rtos: Mutex::new(next_rtos),
                lost: AtomicU32::new(0),
                timed_out: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RtoTimerDelegate for RecordingDelegate {
        async fn rto_timeout(&self, _now: Instant, _scheduled_rto: Duration) -> Option<Duration> {
            self.rto_timeouts.fetch_add(1, Ordering::SeqCst);
            let mut next = self.next_rtos.lock().unwrap();
            if next.is_empty() {
                None
            }
            else {
                Some(next.remove(0))
            }
        }

        async fn connection_lost(&self) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }

        async fn connection_timeout(&self) {
            self.timed_out.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rto_timer_reschedules_until_delegate_stops_it() {
        let delegate = RecordingDelegate::new(vec![secs(2), secs(4)]);
        let mut timer = RtoTimer::new(None, secs(1000), secs(1000), delegate.clone());

        timer.update_rto_timeout(secs(1));

        tokio::time::sleep(secs(1) + Duration::from_millis(10)).await;
        assert_eq!(delegate.rto_timeouts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(secs(2)).await;
        assert_eq!(delegate.rto_timeouts.load(Ordering::SeqCst), 2);

        tokio::time::sleep(secs(4)).await;
        assert_eq!(delegate.rto_timeouts.load(Ordering::SeqCst), 3);

        // the delegate returned None; nothing further fires
        tokio::time::sleep(secs(100)).await;
        assert_eq!(delegate.rto_timeouts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_descheduled_rto_timer_does_not_fire() {
        let delegate = RecordingDelegate::new(vec![secs(1)]);
        let mut timer = RtoTimer::new(None, secs(1000), secs(1000), delegate.clone());

        timer.update_rto_timeout(secs(1));
        timer.deschedule_rto();

        tokio::time::sleep(secs(10)).await;
        assert_eq!(delegate.rto_timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_warning_then_timeout() {
        let delegate = RecordingDelegate::new(vec![]);
        let _timer = RtoTimer::new(Some(secs(2)), secs(10), secs(10), delegate.clone());

        tokio::time::sleep(secs(2) + Duration::from_millis(10)).await;
        assert_eq!(delegate.lost.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.timed_out.load(Ordering::SeqCst), 0);

        tokio::time::sleep(secs(8)).await;
        assert_eq!(delegate.timed_out.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_got_packet_resets_connection_timeout_and_reports_regained() {
        let delegate = RecordingDelegate::new(vec![]);
        let mut timer = RtoTimer::new(Some(secs(2)), secs(10), secs(10), delegate.clone());

        tokio::time::sleep(secs(3)).await;
        assert_eq!(delegate.lost.load(Ordering::SeqCst), 1);

        assert!(timer.got_packet());
        assert!(!timer.got_packet());

        // timeout was pushed out by the reset
        tokio::time::sleep(secs(8)).await;
        assert_eq!(delegate.timed_out.load(Ordering::SeqCst), 0);
        tokio::time::sleep(secs(3)).await;
        assert_eq!(delegate.timed_out.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_timeout_applies_until_opened() {
        let delegate = RecordingDelegate::new(vec![]);
        let mut timer = RtoTimer::new(None, secs(30), secs(5), delegate.clone());

        tokio::time::sleep(secs(5) + Duration::from_millis(10)).await;
        assert_eq!(delegate.timed_out.load(Ordering::SeqCst), 1);

        timer.connection_opened();
        let _ = timer.got_packet();
        tokio::time::sleep(secs(6)).await;
        // now on the regular, longer timeout
        assert_eq!(delegate.timed_out.load(Ordering::SeqCst), 1);
        tokio::time::sleep(secs(25)).await;
        assert_eq!(delegate.timed_out.load(Ordering::SeqCst), 2);
    }
}
