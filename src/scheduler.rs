//! Alert scheduler (C6): the tick loop co-ordinating wall-clock expiry
//! with newly received CAP events, grounded step-for-step on
//! `original_source/dab/watcher.py::DABWatcher.run` (expiry sweep,
//! per-message drain, and the `num == 0` / `num == 1` / `num > 1` TTS
//! branching, translated here into edge detection handed off to C7).

use crate::stats::Stats;
use crate::switchover::Switchover;
use crate::tts::{Transcoder, TtsEngine};
use crate::types::{AlertEvent, BroadcastState, CapTimestamp, SchedulerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct AlertScheduler<T: TtsEngine, U: Transcoder> {
    state: SchedulerState,
    rx: mpsc::Receiver<AlertEvent>,
    switchover: Arc<Switchover<T, U>>,
    data_senders: Vec<mpsc::Sender<Vec<u8>>>,
    stats: Arc<Stats>,
    tick_interval: Duration,
    last_active_signature: Vec<(String, String)>,
}

impl<T: TtsEngine, U: Transcoder> AlertScheduler<T, U> {
    pub fn new(
        rx: mpsc::Receiver<AlertEvent>,
        switchover: Arc<Switchover<T, U>>,
        data_senders: Vec<mpsc::Sender<Vec<u8>>>,
        stats: Arc<Stats>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            state: SchedulerState::new(),
            rx,
            switchover,
            data_senders,
            stats,
            tick_interval,
            last_active_signature: Vec::new(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("scheduler loop shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&mut self) {
        let now: CapTimestamp = chrono::Local::now().fixed_offset();

        let expired = self.state.sweep_expired(now);
        for _ in 0..expired {
            self.stats.record_alert_expired();
        }

        if !self.state.active().is_empty() || !self.state.pending().is_empty() {
            self.rebroadcast_data(now).await;
        }

        self.state.promote_due(now);

        self.drain_one(now).await;

        self.run_edge_action().await;
    }

    /// Push the concatenation of every active/pending alert's raw XML
    /// through C2 into each data subchannel, without blocking the tick if
    /// a subchannel's framer task is backed up.
    async fn rebroadcast_data(&self, _now: CapTimestamp) {
        if self.data_senders.is_empty() {
            return;
        }

        let mut payload = Vec::new();
        for alert in self.state.active().iter().chain(self.state.pending()) {
            payload.extend_from_slice(alert.raw());
        }
        if payload.is_empty() {
            return;
        }

        for sender in &self.data_senders {
            if sender.try_send(payload.clone()).is_err() {
                tracing::debug!("data subchannel pump busy, skipping this tick's rebroadcast");
            }
        }
    }

    async fn drain_one(&mut self, now: CapTimestamp) {
        let Ok(event) = self.rx.try_recv() else { return };

        match event {
            AlertEvent::LinkTest { .. } => {}
            AlertEvent::Alert { ref identifier, effective, expires, .. } => {
                if expires <= now {
                    tracing::info!(identifier, "dropping already-expired alert at intake");
                    return;
                }
                if effective <= now {
                    tracing::info!(identifier, "new CAP alert, now active");
                    self.state.push_active(event);
                } else {
                    tracing::info!(identifier, "new CAP alert, pending until effective");
                    self.state.push_pending(event);
                }
                self.stats.record_alert_scheduled();
            }
            AlertEvent::Cancel { ref identifier, ref references, .. } => {
                if self.state.cancel_matching(references) {
                    tracing::info!(identifier, "cancelled CAP alert");
                    self.stats.record_alert_cancelled();
                } else {
                    tracing::warn!(identifier, "cancel referenced no known alert");
                }
            }
        }
    }

    async fn run_edge_action(&mut self) {
        let desired = self.state.desired_state();
        let edge_changed = self.state.last_broadcast_state != Some(desired);

        let current_signature: Vec<(String, String)> =
            self.state.active().iter().map(|a| (a.identifier().to_string(), a.sent().to_rfc3339())).collect();
        let composition_changed = desired == BroadcastState::Warning && current_signature != self.last_active_signature;

        if !edge_changed && !composition_changed {
            return;
        }

        self.switchover.apply(desired, self.state.active()).await;
        self.state.last_broadcast_state = Some(desired);
        self.last_active_signature = if desired == BroadcastState::Warning { current_signature } else { Vec::new() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dab::mux::MuxClient;
    use crate::dab::supervisor::StreamSupervisor;
    use crate::switchover::SwitchoverTargets;
    use crate::tts::{EspeakTtsEngine, FfmpegTranscoder};
    use chrono::DateTime;

    fn make_alert(id: &str, effective: CapTimestamp, expires: CapTimestamp) -> AlertEvent {
        AlertEvent::Alert {
            identifier: id.to_string(),
            sender: "sender@x".to_string(),
            sent: effective,
            raw: format!("<alert id=\"{id}\"/>").into_bytes(),
            language: "en-US".to_string(),
            effective,
            expires,
            description: "test alert".to_string(),
        }
    }

    async fn make_scheduler(
        rx: mpsc::Receiver<AlertEvent>,
    ) -> AlertScheduler<EspeakTtsEngine, FfmpegTranscoder> {
        let dir = tempfile::tempdir().unwrap();
        let stats = Stats::new();
        let mux_config = Arc::new(tokio::sync::Mutex::new(
            crate::config::muxcfg::MuxConfig::load(dir.path().join("dabmux.cfg"), 9999).unwrap(),
        ));
        let supervisor = Arc::new(tokio::sync::Mutex::new(StreamSupervisor::new(
            "/usr/bin".into(),
            dir.path().to_path_buf(),
            stats.clone(),
        )));
        let mux = Arc::new(MuxClient::new(dir.path().join("mux.sock"), Duration::from_millis(50)));
        let targets = SwitchoverTargets { alarm_service: "srv-audio".into(), audio: vec![], data: vec![] };
        let switchover = Arc::new(Switchover::new(
            mux,
            mux_config,
            supervisor,
            targets,
            crate::switchover::WarningConfig::default(),
            EspeakTtsEngine::default(),
            FfmpegTranscoder::default(),
            dir.path().to_path_buf(),
        ));
        AlertScheduler::new(rx, switchover, Vec::new(), stats, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn promotes_alert_once_effective_time_arrives() {
        let (tx, rx) = mpsc::channel(8);
        let mut scheduler = make_scheduler(rx).await;

        let now: CapTimestamp = DateTime::parse_from_rfc3339("2026-01-01T12:00:00+00:00").unwrap();
        let a = make_alert("a", now - chrono::Duration::seconds(1), now + chrono::Duration::seconds(60));
        let b = make_alert("b", now + chrono::Duration::seconds(30), now + chrono::Duration::seconds(90));
        tx.try_send(a).unwrap();
        tx.try_send(b).unwrap();

        scheduler.drain_one(now).await;
        scheduler.drain_one(now).await;
        scheduler.state.promote_due(now);

        assert_eq!(scheduler.state.active().len(), 1);
        assert_eq!(scheduler.state.pending().len(), 1);

        let later = now + chrono::Duration::seconds(31);
        scheduler.state.promote_due(later);
        assert_eq!(scheduler.state.active().len(), 2);
        assert_eq!(scheduler.state.pending().len(), 0);
    }

    #[tokio::test]
    async fn cancel_removes_matching_alert_and_unknown_cancel_is_a_no_op() {
        let (tx, rx) = mpsc::channel(8);
        let mut scheduler = make_scheduler(rx).await;

        let now: CapTimestamp = DateTime::parse_from_rfc3339("2026-01-01T12:00:00+00:00").unwrap();
        let a = make_alert("a", now - chrono::Duration::seconds(1), now + chrono::Duration::seconds(60));
        let reference_key = a.reference_key();
        tx.try_send(a).unwrap();
        scheduler.drain_one(now).await;
        assert_eq!(scheduler.state.active().len(), 1);

        let cancel = AlertEvent::Cancel {
            identifier: "cancel-1".into(),
            sender: "sender@x".into(),
            sent: now,
            raw: Vec::new(),
            references: vec![reference_key],
        };
        tx.try_send(cancel).unwrap();
        scheduler.drain_one(now).await;
        assert_eq!(scheduler.state.active().len(), 0);

        let bogus_cancel = AlertEvent::Cancel {
            identifier: "cancel-2".into(),
            sender: "sender@x".into(),
            sent: now,
            raw: Vec::new(),
            references: vec![crate::types::AlertReference {
                sender: "nobody".into(),
                identifier: "unknown".into(),
                sent: now.to_rfc3339(),
            }],
        };
        tx.try_send(bogus_cancel).unwrap();
        scheduler.drain_one(now).await;
        assert_eq!(scheduler.state.active().len(), 0);
    }

    #[tokio::test]
    async fn edge_action_fires_once_per_state_change_not_every_tick() {
        let (_tx, rx) = mpsc::channel(8);
        let mut scheduler = make_scheduler(rx).await;
        let now: CapTimestamp = DateTime::parse_from_rfc3339("2026-01-01T12:00:00+00:00").unwrap();

        scheduler.run_edge_action().await;
        assert_eq!(scheduler.state.last_broadcast_state, Some(BroadcastState::Quiet));

        let a = make_alert("a", now - chrono::Duration::seconds(1), now + chrono::Duration::seconds(60));
        scheduler.state.push_active(a);
        scheduler.run_edge_action().await;
        assert_eq!(scheduler.state.last_broadcast_state, Some(BroadcastState::Warning));

        let signature_after_first_warning = scheduler.last_active_signature.clone();
        scheduler.run_edge_action().await;
        assert_eq!(scheduler.last_active_signature, signature_after_first_warning);
    }
}
