//! Broadcast switchover (C7). Edge handler invoked by the scheduler (C6)
//! whenever the desired broadcast state flips, grounded on the second half
//! of `original_source/dab/watcher.py::DABWatcher.run` (the
//! `mux_send('set alarm active 0/1')` pair, the per-service label/PTY
//! swap, and the `copy.deepcopy` + `setcfg` pattern for temporarily
//! replacing a stream's configuration).

use crate::config::muxcfg::MuxConfig;
use crate::dab::mux::MuxClient;
use crate::dab::supervisor::StreamSupervisor;
use crate::error::TranscodeError;
use crate::tts::{compose_script, select_language, Transcoder, TtsEngine};
use crate::types::{AlertEvent, BroadcastState, InputKind, OutputKind, StreamDescriptor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The handful of streams the switchover reconfigures, captured once at
/// startup. `audio` carries the Alarm-advertising audio subchannels;
/// `data` the data subchannels that also get rerouted when `replace` is
/// enabled (spec.md §4.7's "data subchannel (if enabled)" clause).
#[derive(Debug, Clone)]
pub struct SwitchoverTargets {
    pub alarm_service: String,
    pub audio: Vec<StreamDescriptor>,
    pub data: Vec<StreamDescriptor>,
}

/// The `warning` section of the main server config (spec.md §6): which
/// parts of the edge action run, and the label/PTY/announcement identity
/// applied during a Warning.
#[derive(Debug, Clone)]
pub struct WarningConfig {
    pub alarm_enabled: bool,
    pub replace_enabled: bool,
    pub data_enabled: bool,
    pub announcement: String,
    pub label: String,
    pub short_label: String,
    pub pty: String,
}

impl Default for WarningConfig {
    fn default() -> Self {
        Self {
            alarm_enabled: true,
            replace_enabled: true,
            data_enabled: true,
            announcement: "alarm".into(),
            label: "Alert".into(),
            short_label: "Alert".into(),
            pty: "3".into(),
        }
    }
}

pub struct Switchover<T: TtsEngine, U: Transcoder> {
    mux: Arc<MuxClient>,
    mux_config: Arc<Mutex<MuxConfig>>,
    supervisor: Arc<Mutex<StreamSupervisor>>,
    targets: SwitchoverTargets,
    warning: WarningConfig,
    tts: T,
    transcoder: U,
    work_dir: PathBuf,
    /// `active`'s `(identifier, sent)` set, so a repeated `Warning` edge
    /// with the same alerts skips re-rendering TTS (spec.md §4.7: "no
    /// redundant TTS rerender").
    last_rendered: Mutex<Vec<(String, String)>>,
}

impl<T: TtsEngine, U: Transcoder> Switchover<T, U> {
    pub fn new(
        mux: Arc<MuxClient>,
        mux_config: Arc<Mutex<MuxConfig>>,
        supervisor: Arc<Mutex<StreamSupervisor>>,
        targets: SwitchoverTargets,
        warning: WarningConfig,
        tts: T,
        transcoder: U,
        work_dir: PathBuf,
    ) -> Self {
        Self { mux, mux_config, supervisor, targets, warning, tts, transcoder, work_dir, last_rendered: Mutex::new(Vec::new()) }
    }

    /// Drive the edge action for `desired`, given the scheduler's current
    /// `active` alert set.
    pub async fn apply(&self, desired: BroadcastState, active: &[AlertEvent]) {
        match desired {
            BroadcastState::Quiet => self.apply_quiet().await,
            BroadcastState::Warning => self.apply_warning(active).await,
        }
    }

    async fn apply_quiet(&self) {
        if self.warning.alarm_enabled {
            if let Err(e) = self.mux.set(&self.warning.announcement, "active", "0").await {
                tracing::warn!(error = %e, "failed to deactivate alarm announcement, will retry next tick");
            } else {
                tracing::info!("deactivated alarm announcement");
            }
        }

        if self.warning.replace_enabled {
            let saved_services = {
                let mut cfg = self.mux_config.lock().await;
                cfg.restore();
                cfg.to_ensemble_config()
            };

            if let Some(service) = saved_services.services.get(&self.targets.alarm_service) {
                if let Err(e) = self.mux.set(&self.targets.alarm_service, "label", &format!("{},{}", service.label, service.short_label)).await {
                    tracing::warn!(error = %e, "failed to restore service label");
                }
                if let Err(e) = self.mux.set(&self.targets.alarm_service, "pty", &service.pty).await {
                    tracing::warn!(error = %e, "failed to restore service PTY");
                }
            }

            let mut supervisor = self.supervisor.lock().await;
            for desc in &self.targets.audio {
                if let Err(e) = supervisor.set_config(desc.clone()).await {
                    tracing::warn!(stream = %desc.name, error = %e, "failed to restore stream config");
                }
            }
        }

        if self.warning.data_enabled {
            let mut supervisor = self.supervisor.lock().await;
            for desc in &self.targets.data {
                if let Err(e) = supervisor.set_config(desc.clone()).await {
                    tracing::warn!(stream = %desc.name, error = %e, "failed to restore stream config");
                }
            }
        }

        self.last_rendered.lock().await.clear();
    }

    async fn apply_warning(&self, active: &[AlertEvent]) {
        let rendered_key: Vec<(String, String)> =
            active.iter().map(|a| (a.identifier().to_string(), a.sent().to_rfc3339())).collect();

        let needs_render = *self.last_rendered.lock().await != rendered_key;

        if needs_render && !active.is_empty() {
            if let Err(e) = self.render_tts(active).await {
                tracing::warn!(error = %e, "TTS/transcode failed, audio swap skipped this edge");
            } else {
                *self.last_rendered.lock().await = rendered_key;
            }
        }

        if self.warning.alarm_enabled {
            if let Err(e) = self.mux.set(&self.warning.announcement, "active", "1").await {
                tracing::warn!(error = %e, "failed to activate alarm announcement, will retry next tick");
            } else {
                tracing::info!("activated alarm announcement");
            }
        }

        if self.warning.replace_enabled {
            {
                let mut cfg = self.mux_config.lock().await;
                cfg.save();
                let service_cfg = crate::types::ServiceConfig {
                    label: self.warning.label.clone(),
                    short_label: self.warning.short_label.clone(),
                    pty: self.warning.pty.clone(),
                    accepts_alarm: true,
                };
                cfg.apply_service(&self.targets.alarm_service, &service_cfg);
            }

            if let Err(e) = self
                .mux
                .set(&self.targets.alarm_service, "label", &format!("{},{}", self.warning.label, self.warning.short_label))
                .await
            {
                tracing::warn!(error = %e, "failed to set warning service label");
            }
            if let Err(e) = self.mux.set(&self.targets.alarm_service, "pty", &self.warning.pty).await {
                tracing::warn!(error = %e, "failed to set warning service PTY");
            }

            let wav_path = self.work_dir.join("sub-alarm").join("tts.wav");
            let mut supervisor = self.supervisor.lock().await;
            for desc in &self.targets.audio {
                let warning_desc = StreamDescriptor {
                    input_kind: InputKind::File,
                    input_location: wav_path.to_string_lossy().to_string(),
                    pad_enabled: false,
                    ..desc.clone()
                };
                if let Err(e) = supervisor.set_config(warning_desc).await {
                    tracing::warn!(stream = %desc.name, error = %e, "failed to swap stream to warning audio");
                }
            }
        }

        if self.warning.data_enabled {
            // `targets.data` descriptors already point at C6's data-pump FIFO
            // (built by `data_pump_descriptor`); re-applying them here is
            // what brings the subchannel encoder up if it isn't already.
            let mut supervisor = self.supervisor.lock().await;
            for desc in &self.targets.data {
                if let Err(e) = supervisor.set_config(desc.clone()).await {
                    tracing::warn!(stream = %desc.name, error = %e, "failed to reroute data subchannel");
                }
            }
        }
    }

    async fn render_tts(&self, active: &[AlertEvent]) -> Result<(), TranscodeError> {
        tokio::fs::create_dir_all(self.work_dir.join("sub-alarm"))
            .await
            .map_err(|e| TranscodeError::Synthesis(e.to_string()))?;

        let language = select_language(active);
        let script = compose_script(&self.tts, active);

        let mp3_path = self.work_dir.join("sub-alarm").join("tts.mp3");
        let wav_path = self.work_dir.join("sub-alarm").join("tts.wav");

        self.tts.synthesize(&script, language, &mp3_path).await?;
        self.transcoder.transcode_to_wav(&mp3_path, &wav_path).await?;
        Ok(())
    }
}

/// Build the data-subchannel descriptor pointing at C6's data-pump FIFO,
/// used when wiring up [`SwitchoverTargets`] at startup.
pub fn data_pump_descriptor(name: impl Into<String>) -> StreamDescriptor {
    StreamDescriptor {
        name: name.into(),
        output_kind: OutputKind::PacketData,
        input_kind: InputKind::Fifo,
        input_location: String::new(),
        bitrate_kbps: 8,
        protection_profile: "EEP_A".into(),
        protection_level: 3,
        pad_enabled: false,
        pad_length: 0,
    }
}
