use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lock-free counters for the gateway's major event classes.
#[derive(Debug)]
pub struct Stats {
    pub bulletins_received: AtomicU64,
    pub bulletins_accepted: AtomicU64,
    pub parse_errors: AtomicU64,
    pub link_tests: AtomicU64,
    pub alerts_scheduled: AtomicU64,
    pub alerts_cancelled: AtomicU64,
    pub alerts_expired: AtomicU64,
    pub intake_queue_drops: AtomicU64,
    pub mux_commands_sent: AtomicU64,
    pub mux_command_failures: AtomicU64,
    pub stream_restarts: AtomicU64,
    pub transcode_failures: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bulletins_received: AtomicU64::new(0),
            bulletins_accepted: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            link_tests: AtomicU64::new(0),
            alerts_scheduled: AtomicU64::new(0),
            alerts_cancelled: AtomicU64::new(0),
            alerts_expired: AtomicU64::new(0),
            intake_queue_drops: AtomicU64::new(0),
            mux_commands_sent: AtomicU64::new(0),
            mux_command_failures: AtomicU64::new(0),
            stream_restarts: AtomicU64::new(0),
            transcode_failures: AtomicU64::new(0),
        })
    }

    #[inline(always)]
    pub fn record_bulletin_received(&self) {
        self.bulletins_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_bulletin_accepted(&self) {
        self.bulletins_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_link_test(&self) {
        self.link_tests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_alert_scheduled(&self) {
        self.alerts_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_alert_cancelled(&self) {
        self.alerts_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_alert_expired(&self) {
        self.alerts_expired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_intake_queue_drop(&self) {
        self.intake_queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_mux_command(&self) {
        self.mux_commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_mux_failure(&self) {
        self.mux_command_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_stream_restart(&self) {
        self.stream_restarts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_transcode_failure(&self) {
        self.transcode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot and reset counters, return rates over the elapsed window.
    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);

        let received = self.bulletins_received.swap(0, Ordering::Relaxed);
        let accepted = self.bulletins_accepted.swap(0, Ordering::Relaxed);

        StatsSnapshot {
            bulletins_per_sec: (received as f64) / secs,
            bulletins_accepted: accepted,
            parse_errors: self.parse_errors.swap(0, Ordering::Relaxed),
            link_tests: self.link_tests.swap(0, Ordering::Relaxed),
            alerts_scheduled: self.alerts_scheduled.swap(0, Ordering::Relaxed),
            alerts_cancelled: self.alerts_cancelled.swap(0, Ordering::Relaxed),
            alerts_expired: self.alerts_expired.swap(0, Ordering::Relaxed),
            intake_queue_drops: self.intake_queue_drops.swap(0, Ordering::Relaxed),
            mux_commands_sent: self.mux_commands_sent.swap(0, Ordering::Relaxed),
            mux_command_failures: self.mux_command_failures.swap(0, Ordering::Relaxed),
            stream_restarts: self.stream_restarts.swap(0, Ordering::Relaxed),
            transcode_failures: self.transcode_failures.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub bulletins_per_sec: f64,
    pub bulletins_accepted: u64,
    pub parse_errors: u64,
    pub link_tests: u64,
    pub alerts_scheduled: u64,
    pub alerts_cancelled: u64,
    pub alerts_expired: u64,
    pub intake_queue_drops: u64,
    pub mux_commands_sent: u64,
    pub mux_command_failures: u64,
    pub stream_restarts: u64,
    pub transcode_failures: u64,
}

/// Background stats reporter task, logged via `tracing` at a fixed cadence.
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        tracing::info!(
            bulletins_per_sec = format_args!("{:.2}", snap.bulletins_per_sec),
            accepted = snap.bulletins_accepted,
            parse_errors = snap.parse_errors,
            link_tests = snap.link_tests,
            scheduled = snap.alerts_scheduled,
            cancelled = snap.alerts_cancelled,
            expired = snap.alerts_expired,
            queue_drops = snap.intake_queue_drops,
            mux_commands = snap.mux_commands_sent,
            mux_failures = snap.mux_command_failures,
            stream_restarts = snap.stream_restarts,
            transcode_failures = snap.transcode_failures,
            "stats"
        );
    }
}
