//! Stream supervisor (C4): one task per configured subchannel, restarting
//! its encoder (and PAD encoder) on failure.
//!
//! Audio subchannels are grounded on `original_source/dab/audio.py::DABAudioStream`:
//! a fail counter capped at 4 attempts, lockstep PAD termination bounded to
//! 5 s after the audio process exits, and a 2 s backoff before restarting.
//! `PacketData` subchannels are grounded on `dab/data.py::DABDataStream`: an
//! in-process pump that frames pushed blocks through [`crate::dab::framer`]
//! and writes them to the subchannel's IPC FIFO.

use crate::error::SupervisorError;
use crate::fifo;
use crate::stats::Stats;
use crate::types::{InputKind, OutputKind, StreamDescriptor};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_RESTARTS: u32 = 4;
const RESTART_BACKOFF: Duration = Duration::from_secs(2);
const PAD_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const CONFIG_SWAP_SETTLE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Running,
    Stopped,
    Misconfigured,
}

impl From<u8> for StreamStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => StreamStatus::Stopped,
            1 => StreamStatus::Running,
            _ => StreamStatus::Misconfigured,
        }
    }
}

impl From<StreamStatus> for u8 {
    fn from(s: StreamStatus) -> Self {
        match s {
            StreamStatus::Stopped => 0,
            StreamStatus::Running => 1,
            StreamStatus::Misconfigured => 2,
        }
    }
}

struct ManagedStream {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    status: Arc<AtomicU8>,
    data_tx: Option<tokio::sync::mpsc::Sender<Vec<u8>>>,
}

/// Owns every configured subchannel's encoder lifecycle.
pub struct StreamSupervisor {
    odr_bin_path: PathBuf,
    work_dir: PathBuf,
    stats: Arc<Stats>,
    streams: HashMap<String, ManagedStream>,
}

impl StreamSupervisor {
    pub fn new(odr_bin_path: PathBuf, work_dir: PathBuf, stats: Arc<Stats>) -> Self {
        Self { odr_bin_path, work_dir, stats, streams: HashMap::new() }
    }

    pub fn status(&self, name: &str) -> StreamStatus {
        self.streams
            .get(name)
            .map(|s| StreamStatus::from(s.status.load(Ordering::Relaxed)))
            .unwrap_or(StreamStatus::Stopped)
    }

    /// A channel feeding the given `PacketData` stream's framer, or `None`
    /// if no such stream is running. The scheduler (C6) pushes raw alert
    /// bytes here once per tick; this task owns the continuity/repetition
    /// state across the pushes (spec.md §5: exclusive per-supervisor-task
    /// ownership of `StreamDescriptor.runtime`).
    pub fn data_sender(&self, name: &str) -> Option<tokio::sync::mpsc::Sender<Vec<u8>>> {
        self.streams.get(name).and_then(|s| s.data_tx.clone())
    }

    /// Start supervisor tasks for every descriptor, replacing any existing
    /// task with the same name.
    pub async fn start_all(&mut self, descriptors: Vec<StreamDescriptor>) -> Result<(), SupervisorError> {
        for desc in descriptors {
            self.start(desc).await?;
        }
        Ok(())
    }

    /// Swap a running stream's configuration, e.g. at a broadcast-state
    /// edge (C7 calling `set_config(subchannel, default|warning)`). Joins
    /// the current process, waits a short settle interval for its sockets
    /// to unbind, then spawns with the new config.
    pub async fn set_config(&mut self, desc: StreamDescriptor) -> Result<(), SupervisorError> {
        self.stop(&desc.name).await;
        tokio::time::sleep(CONFIG_SWAP_SETTLE).await;
        self.start(desc).await
    }

    pub async fn start(&mut self, desc: StreamDescriptor) -> Result<(), SupervisorError> {
        if let Err(e) = desc.validate() {
            tracing::error!(stream = %desc.name, error = %e, "stream misconfigured, not starting");
            return Err(SupervisorError::Misconfigured(desc.name.clone(), e.to_string()));
        }

        self.stop(&desc.name).await;

        let cancel = CancellationToken::new();
        let status = Arc::new(AtomicU8::new(u8::from(StreamStatus::Running)));
        let name = desc.name.clone();
        let (data_tx, data_rx) = if desc.output_kind == OutputKind::PacketData {
            let (tx, rx) = tokio::sync::mpsc::channel::<Vec<u8>>(32);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let handle = {
            let cancel = cancel.clone();
            let status = status.clone();
            let odr_bin_path = self.odr_bin_path.clone();
            let fifo_path = self.work_dir.join(format!("{}.fifo", desc.name));
            let stats = self.stats.clone();
            tokio::spawn(async move {
                match desc.output_kind {
                    OutputKind::PacketData => {
                        run_packet_pump(desc, fifo_path, data_rx.unwrap(), cancel.clone(), status.clone()).await
                    }
                    OutputKind::DabAudio | OutputKind::DabPlusAudio => {
                        run_audio_stream(desc, odr_bin_path, fifo_path, cancel.clone(), status.clone(), stats).await
                    }
                }
                status.store(u8::from(StreamStatus::Stopped), Ordering::Relaxed);
            })
        };

        self.streams.insert(name, ManagedStream { cancel, handle, status, data_tx });
        Ok(())
    }

    pub async fn stop(&mut self, name: &str) {
        if let Some(managed) = self.streams.remove(name) {
            managed.cancel.cancel();
            let _ = managed.handle.await;
        }
    }

    pub async fn stop_all(&mut self) {
        for (_, managed) in self.streams.drain() {
            managed.cancel.cancel();
        }
        for (_, managed) in std::mem::take(&mut self.streams) {
            let _ = managed.handle.await;
        }
    }
}

/// Audio encoder lifecycle for `DabAudio`/`DabPlusAudio` subchannels.
async fn run_audio_stream(
    desc: StreamDescriptor,
    odr_bin_path: PathBuf,
    fifo_path: PathBuf,
    cancel: CancellationToken,
    status: Arc<AtomicU8>,
    stats: Arc<Stats>,
) {
    let mut failcounter: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        if let Err(e) = fifo::create_fifo(Some(&fifo_path)) {
            tracing::error!(stream = %desc.name, error = %e, "failed to create encoder output fifo");
            status.store(u8::from(StreamStatus::Misconfigured), Ordering::Relaxed);
            return;
        }

        let mut audio_cmd = build_audio_command(&odr_bin_path, &desc, &fifo_path);
        let mut audio_child = match audio_cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(stream = %desc.name, error = %e, "failed to spawn encoder");
                fifo::remove_fifo(&fifo_path);
                failcounter += 1;
                if failcounter >= MAX_RESTARTS {
                    status.store(u8::from(StreamStatus::Misconfigured), Ordering::Relaxed);
                    return;
                }
                tokio::time::sleep(RESTART_BACKOFF).await;
                continue;
            }
        };

        let mut pad_child = if desc.pad_enabled {
            build_pad_command(&odr_bin_path, &desc).spawn().ok()
        } else {
            None
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = audio_child.start_kill();
                let _ = audio_child.wait().await;
                terminate_pad(pad_child.take()).await;
                fifo::remove_fifo(&fifo_path);
                return;
            }
            result = audio_child.wait() => {
                fifo::remove_fifo(&fifo_path);
                terminate_pad(pad_child.take()).await;
                failcounter += 1;
                stats.record_stream_restart();
                tracing::warn!(stream = %desc.name, failcounter, exit = ?result, "encoder exited, will restart");
                if failcounter >= MAX_RESTARTS {
                    tracing::error!(stream = %desc.name, "encoder failed too many times, giving up");
                    status.store(u8::from(StreamStatus::Misconfigured), Ordering::Relaxed);
                    return;
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(RESTART_BACKOFF).await;
    }
}

/// Terminate the PAD encoder with a bounded grace period, mirroring
/// `DABAudioStream.run`'s `self.pad.terminate()` + bounded `wait()`.
async fn terminate_pad(pad_child: Option<tokio::process::Child>) {
    let Some(mut pad) = pad_child else { return };
    let _ = pad.start_kill();
    let _ = tokio::time::timeout(PAD_SHUTDOWN_GRACE, pad.wait()).await;
}

fn build_audio_command(odr_bin_path: &std::path::Path, desc: &StreamDescriptor, output_fifo: &std::path::Path) -> Command {
    let mut cmd = Command::new(odr_bin_path.join("odr-audioenc"));

    match desc.input_kind {
        InputKind::File | InputKind::Fifo => {
            cmd.arg("--input").arg(&desc.input_location);
        }
        InputKind::GstUri => {
            cmd.arg("--gst-uri").arg(&desc.input_location);
        }
    }

    cmd.arg("--bitrate").arg(desc.bitrate_kbps.to_string());
    if desc.output_kind == OutputKind::DabPlusAudio {
        cmd.arg("--dabplus");
    }
    cmd.arg("--output").arg(output_fifo);
    if desc.pad_enabled {
        cmd.arg("--pad").arg(desc.pad_length.to_string());
    }
    cmd.kill_on_drop(true);
    cmd
}

fn build_pad_command(odr_bin_path: &std::path::Path, desc: &StreamDescriptor) -> Command {
    let mut cmd = Command::new(odr_bin_path.join("odr-padenc"));
    cmd.arg("--pad").arg(desc.pad_length.to_string());
    cmd.arg("--output").arg(format!("/tmp/{}.pad", desc.name));
    cmd.kill_on_drop(true);
    cmd
}

/// `PacketData` in-process pump: frame whatever bytes the scheduler (C6)
/// pushes through `data_rx` and write the result to the subchannel's IPC
/// FIFO, consumed in turn by the multiplexer. One framer instance lives
/// for the whole task lifetime so the MSC continuity/repetition index
/// advances correctly across ticks.
async fn run_packet_pump(
    desc: StreamDescriptor,
    fifo_path: PathBuf,
    mut data_rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    status: Arc<AtomicU8>,
) {
    if let Err(e) = fifo::create_fifo(Some(&fifo_path)) {
        tracing::error!(stream = %desc.name, error = %e, "failed to create packet data fifo");
        status.store(u8::from(StreamStatus::Misconfigured), Ordering::Relaxed);
        return;
    }

    let mut group_builder = super::framer::MscDataGroupBuilder::new();
    let mut packet_builder = super::framer::PacketBuilder::new(0);
    let mut output: Option<tokio::net::unix::pipe::Sender> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                fifo::remove_fifo(&fifo_path);
                return;
            }
            chunk = data_rx.recv() => {
                let Some(chunk) = chunk else {
                    fifo::remove_fifo(&fifo_path);
                    return;
                };

                if output.is_none() {
                    output = tokio::net::unix::pipe::OpenOptions::new().open_sender(&fifo_path).ok();
                }
                let Some(sender) = output.as_mut() else {
                    tracing::warn!(stream = %desc.name, "output fifo has no reader yet, dropping tick");
                    continue;
                };

                let group = group_builder.build(&chunk);
                let packets = packet_builder.build(&group);
                if sender.write_all(&packets).await.is_err() {
                    tracing::warn!(stream = %desc.name, "packet data fifo reader went away");
                    output = None;
                }
            }
        }
    }
}
