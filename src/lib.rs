pub mod cap;
pub mod config;
pub mod dab;
pub mod error;
pub mod fifo;
pub mod scheduler;
pub mod stats;
pub mod switchover;
pub mod tts;
pub mod types;

use config::muxcfg::MuxConfig;
use config::streamscfg::StreamsConfig;
use config::ServerConfig;
use dab::mux::MuxClient;
use dab::supervisor::StreamSupervisor;
use scheduler::AlertScheduler;
use stats::Stats;
use std::sync::Arc;
use std::time::Duration;
use switchover::{Switchover, SwitchoverTargets};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tts::{EspeakTtsEngine, FfmpegTranscoder};
use types::OutputKind;

/// boost-info `remotecontrol.telnetport`, written into the on-disk mux
/// config for operator reference; the gateway itself talks to ODR-DabMux
/// over the Unix control socket, not telnet.
pub const MUX_TELNET_PORT: u16 = 12722;

/// Wire every component together and run until `shutdown` is cancelled.
/// Split out of `main` so integration tests can drive the same startup path
/// against a fake mux/supervisor.
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    info!(
        listen = config.cap_listen_addr(),
        streams_config = %config.streams_config_path.display(),
        mux_config = %config.mux_config_path.display(),
        "cap-dab-gateway starting"
    );

    let stats = Stats::new();

    let stats_clone = stats.clone();
    let stats_interval = config.stats_interval_secs;
    tokio::spawn(async move {
        stats::stats_reporter(stats_clone, stats_interval).await;
    });

    let streams_config = StreamsConfig::load(&config.streams_config_path)?;
    let descriptors = streams_config.stream_descriptors()?;

    let mux_config = Arc::new(Mutex::new(MuxConfig::load(&config.mux_config_path, MUX_TELNET_PORT)?));
    let alarm_service = {
        let cfg = mux_config.lock().await;
        cfg.to_ensemble_config()
            .services
            .iter()
            .find(|(_, s)| s.accepts_alarm)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| "srv-alarm".to_string())
    };

    let supervisor = Arc::new(Mutex::new(StreamSupervisor::new(
        config.odr_bin_path.clone(),
        config.work_dir.clone(),
        stats.clone(),
    )));
    {
        let mut s = supervisor.lock().await;
        s.start_all(descriptors.clone()).await?;
    }

    let mut data_senders = Vec::new();
    let mut data_targets = Vec::new();
    let mut audio_targets = Vec::new();
    for desc in &descriptors {
        match desc.output_kind {
            OutputKind::PacketData => {
                if let Some(sender) = supervisor.lock().await.data_sender(&desc.name) {
                    data_senders.push(sender);
                }
                data_targets.push(desc.clone());
            }
            OutputKind::DabAudio | OutputKind::DabPlusAudio => audio_targets.push(desc.clone()),
        }
    }

    let mux = Arc::new(MuxClient::new(&config.mux_socket_path, Duration::from_millis(config.mux_timeout_ms)));

    let targets = SwitchoverTargets { alarm_service, audio: audio_targets, data: data_targets };
    let switchover = Arc::new(Switchover::new(
        mux,
        mux_config,
        supervisor,
        targets,
        config.warning_config(),
        EspeakTtsEngine::default(),
        FfmpegTranscoder::default(),
        config.work_dir.clone(),
    ));

    let parser = Arc::new(cap::parser::CapParser::new(
        config.strict,
        config.ack_identifier_prefix.clone(),
        config.ack_sender.clone(),
    ));
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let intake_state = cap::server::CapIntakeState::new(parser, tx, stats.clone(), config.strict);

    let scheduler = AlertScheduler::new(
        rx,
        switchover,
        data_senders,
        stats.clone(),
        Duration::from_secs(config.scheduler_tick_secs),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    let intake_handle =
        cap::server::start_intake_server(&config.host, config.cap_port, intake_state, shutdown.clone()).await?;

    info!("CAP intake and DAB switchover gateway ready");

    let _ = intake_handle.await;
    shutdown.cancel();
    let _ = scheduler_handle.await;

    Ok(())
}
