use clap::Parser;

pub mod muxcfg;
pub mod streamscfg;

/// CAP v1.2 emergency alert intake and DAB broadcast switchover gateway.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct ServerConfig {
    /// CAP intake listen address
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// CAP intake HTTP port
    #[arg(long, default_value_t = 8080)]
    pub cap_port: u16,

    /// Reject CAP bulletins (and mux/TTS anomalies) that would otherwise
    /// only be logged as a warning.
    #[arg(long, default_value_t = false)]
    pub strict: bool,

    /// Capacity of the queue between the intake server and the scheduler
    #[arg(long, default_value_t = 256)]
    pub channel_capacity: usize,

    /// Alert scheduler tick interval, in seconds
    #[arg(long, default_value_t = 1)]
    pub scheduler_tick_secs: u64,

    /// Identifier prefix used when generating CAP `Ack` responses
    #[arg(long, default_value = "cfns.ack")]
    pub ack_identifier_prefix: String,

    /// Sender address reported in generated `Ack` responses
    #[arg(long, default_value = "cap-dab-gateway@localhost")]
    pub ack_sender: String,

    /// Path to the hierarchical ODR-DabMux config file (boost-info format)
    #[arg(long, default_value = "./dabmux.cfg")]
    pub mux_config_path: std::path::PathBuf,

    /// Path to the flat streams.ini config file
    #[arg(long, default_value = "./streams.ini")]
    pub streams_config_path: std::path::PathBuf,

    /// Unix domain socket path for the ODR-DabMux remote control channel
    #[arg(long, default_value = "/tmp/cap-dab-gateway/mux.sock")]
    pub mux_socket_path: std::path::PathBuf,

    /// Directory containing the odr-audioenc/odr-padenc binaries
    #[arg(long, default_value = "/usr/bin")]
    pub odr_bin_path: std::path::PathBuf,

    /// Timeout for a single mux control-channel round trip, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub mux_timeout_ms: u64,

    /// Directory used for transcoded TTS output and stream FIFOs
    #[arg(long, default_value = "/tmp/cap-dab-gateway")]
    pub work_dir: std::path::PathBuf,

    /// Stats logging interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 30)]
    pub stats_interval_secs: u64,

    /// Directory for rotating log files (in addition to stderr)
    #[arg(long, default_value = "./log")]
    pub log_dir: std::path::PathBuf,

    /// Maximum size of a single rotated log file, in KiB
    #[arg(long, default_value_t = 1024)]
    pub max_log_size_kib: u64,

    /// Toggle the native DAB Alarm announcement flag on the Warning/Quiet edge
    #[arg(long, default_value_t = true)]
    pub warning_alarm_enabled: bool,

    /// Swap the Alarm-advertising services' audio input/label/PTY on the edge
    #[arg(long, default_value_t = true)]
    pub warning_replace_enabled: bool,

    /// Reroute data subchannels to the alert packet stream on the edge
    #[arg(long, default_value_t = true)]
    pub warning_data_enabled: bool,

    /// Name of the mux announcement toggled for a warning
    #[arg(long, default_value = "alarm")]
    pub warning_announcement: String,

    /// Service label applied to Alarm-advertising services during a warning
    #[arg(long, default_value = "Alert")]
    pub warning_label: String,

    /// Service short label applied during a warning
    #[arg(long, default_value = "Alert")]
    pub warning_short_label: String,

    /// Service PTY code applied during a warning
    #[arg(long, default_value = "3")]
    pub warning_pty: String,
}

impl ServerConfig {
    pub fn cap_listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.cap_port)
    }

    pub fn warning_config(&self) -> crate::switchover::WarningConfig {
        crate::switchover::WarningConfig {
            alarm_enabled: self.warning_alarm_enabled,
            replace_enabled: self.warning_replace_enabled,
            data_enabled: self.warning_data_enabled,
            announcement: self.warning_announcement.clone(),
            label: self.warning_label.clone(),
            short_label: self.warning_short_label.clone(),
            pty: self.warning_pty.clone(),
        }
    }
}
