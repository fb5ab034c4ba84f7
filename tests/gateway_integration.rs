//! End-to-end scenarios S1-S6 (spec.md §8), driving the real CAP intake
//! router and alert scheduler against a recording fake multiplexer instead
//! of a real ODR-DabMux, and fake TTS/transcode collaborators instead of
//! shelling out to espeak-ng/ffmpeg — the same "fake the external system,
//! keep the wiring real" approach `dab/mux.rs`'s own `spawn_fake_mux` test
//! helper uses for property 9.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use cap_dab_gateway::cap::parser::CapParser;
use cap_dab_gateway::cap::server::{build_router, start_intake_server, CapIntakeState};
use cap_dab_gateway::config::muxcfg::MuxConfig;
use cap_dab_gateway::dab::mux::MuxClient;
use cap_dab_gateway::dab::supervisor::StreamSupervisor;
use cap_dab_gateway::error::TranscodeError;
use cap_dab_gateway::scheduler::AlertScheduler;
use cap_dab_gateway::stats::Stats;
use cap_dab_gateway::switchover::{data_pump_descriptor, Switchover, SwitchoverTargets, WarningConfig};
use cap_dab_gateway::tts::{Transcoder, TtsEngine};
use chrono::{DateTime, Local};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tower::ServiceExt;

struct InstantTts;

impl TtsEngine for InstantTts {
    fn insert_silence(&self, ms: u32) -> String {
        format!("[silence {ms}ms]")
    }

    async fn synthesize(&self, _text: &str, _language: &str, out_mp3: &Path) -> Result<(), TranscodeError> {
        tokio::fs::write(out_mp3, b"fake-mp3-bytes")
            .await
            .map_err(|e| TranscodeError::Synthesis(e.to_string()))
    }
}

struct InstantTranscoder;

impl Transcoder for InstantTranscoder {
    async fn transcode_to_wav(&self, _input: &Path, output: &Path) -> Result<(), TranscodeError> {
        // One second of silent PCM s16le, 48 kHz stereo, with a minimal
        // canonical WAV header — enough to satisfy S2's duration/format
        // assertion without shelling out to a real encoder.
        let data_len: u32 = 48_000 * 2 * 2;
        let mut wav = Vec::with_capacity(44 + data_len as usize);
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_len).to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&2u16.to_le_bytes()); // stereo
        wav.extend_from_slice(&48_000u32.to_le_bytes());
        wav.extend_from_slice(&(48_000 * 2 * 2u32).to_le_bytes()); // byte rate
        wav.extend_from_slice(&4u16.to_le_bytes()); // block align
        wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_len.to_le_bytes());
        wav.resize(wav.len() + data_len as usize, 0);
        tokio::fs::write(output, &wav).await.map_err(|e| TranscodeError::Failed(e.to_string()))
    }
}

async fn write_frame(stream: &mut UnixStream, data: &[u8]) -> std::io::Result<()> {
    stream.write_u32_le(data.len() as u32).await?;
    stream.write_all(data).await
}

async fn read_frame(stream: &mut UnixStream) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u32_le().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// A recording stand-in for ODR-DabMux's remote control channel: answers
/// `ping` with `ok`, replies `ok` to every command, and appends each
/// command's comma-joined parts to `log` for assertions.
async fn spawn_recording_mux(path: std::path::PathBuf, log: Arc<Mutex<Vec<String>>>) {
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let log = log.clone();
            tokio::spawn(async move {
                loop {
                    let Ok(ping) = read_frame(&mut stream).await else { return };
                    if ping != b"ping" {
                        return;
                    }
                    if write_frame(&mut stream, b"ok").await.is_err() {
                        return;
                    }

                    let mut len_buf = [0u8; 4];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let count = u32::from_le_bytes(len_buf);
                    let mut parts = Vec::new();
                    for _ in 0..count {
                        let Ok(part) = read_frame(&mut stream).await else { return };
                        parts.push(String::from_utf8_lossy(&part).to_string());
                    }
                    log.lock().await.push(parts.join(","));

                    if write_frame(&mut stream, &1u32.to_le_bytes()).await.is_err() {
                        return;
                    }
                    if write_frame(&mut stream, b"ok").await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    tokio::task::yield_now().await;
}

struct Harness {
    app: axum::Router,
    work_dir: tempfile::TempDir,
    mux_log: Arc<Mutex<Vec<String>>>,
}

async fn build_harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let stats = Stats::new();

    let mux_log = Arc::new(Mutex::new(Vec::new()));
    let mux_sock = dir.path().join("mux.sock");
    spawn_recording_mux(mux_sock.clone(), mux_log.clone()).await;

    let mux_config = Arc::new(Mutex::new(MuxConfig::load(dir.path().join("dabmux.cfg"), 9999).unwrap()));
    let mux = Arc::new(MuxClient::new(&mux_sock, Duration::from_millis(500)));

    let supervisor = Arc::new(Mutex::new(StreamSupervisor::new(
        "/usr/bin".into(),
        dir.path().to_path_buf(),
        stats.clone(),
    )));
    let data_desc = data_pump_descriptor("data1");
    supervisor.lock().await.start_all(vec![data_desc.clone()]).await.unwrap();
    let data_sender = supervisor.lock().await.data_sender("data1").unwrap();

    let targets = SwitchoverTargets { alarm_service: "srv-alarm".into(), audio: vec![], data: vec![data_desc] };
    let switchover = Arc::new(Switchover::new(
        mux,
        mux_config,
        supervisor,
        targets,
        WarningConfig::default(),
        InstantTts,
        InstantTranscoder,
        dir.path().to_path_buf(),
    ));

    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let parser = Arc::new(CapParser::new(true, "cfns.ack", "gateway@test"));
    let state = CapIntakeState::new(parser, tx, stats.clone(), true);
    let app = build_router(state);

    let scheduler = AlertScheduler::new(rx, switchover, vec![data_sender], stats, Duration::from_millis(20));
    tokio::spawn(scheduler.run(tokio_util::sync::CancellationToken::new()));

    // Let the first tick settle the mux to its quiet baseline before any
    // scenario-specific assertions start recording.
    tokio::time::sleep(Duration::from_millis(200)).await;
    mux_log.lock().await.clear();

    Harness { app, work_dir: dir, mux_log }
}

/// Render under CAP's fixed, fractional-second-free timestamp format so the
/// string round-trips through a parse (`CapParser`) and a reformat
/// (`AlertEvent::reference_key`'s `to_rfc3339()`) unchanged — needed for the
/// cancel-reference matching exercised in s4.
fn fmt_ts(dt: DateTime<Local>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

fn alert_xml(identifier: &str, sent: &str, effective: &str, expires: &str, language: &str, description: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<alert xmlns="urn:oasis:names:tc:emergency:cap:1.2">
  <identifier>{identifier}</identifier>
  <sender>rws@x</sender>
  <sent>{sent}</sent>
  <status>Actual</status>
  <msgType>Alert</msgType>
  <scope>Public</scope>
  <info>
    <language>{language}</language>
    <category>Safety</category>
    <event>Flood</event>
    <urgency>Unknown</urgency>
    <severity>Unknown</severity>
    <certainty>Unknown</certainty>
    <effective>{effective}</effective>
    <expires>{expires}</expires>
    <description>{description}</description>
  </info>
</alert>"#
    )
}

fn cancel_xml(identifier: &str, sent: &str, references: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<alert xmlns="urn:oasis:names:tc:emergency:cap:1.2">
  <identifier>{identifier}</identifier>
  <sender>rws@x</sender>
  <sent>{sent}</sent>
  <status>Actual</status>
  <msgType>Cancel</msgType>
  <scope>Public</scope>
  <references>{references}</references>
</alert>"#
    )
}

async fn post_xml(app: &axum::Router, body: String) -> StatusCode {
    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/xml")
        .body(Body::from(body))
        .unwrap();
    app.clone().oneshot(req).await.unwrap().status()
}

async fn wait_for<F: Fn(&[String]) -> bool>(log: &Arc<Mutex<Vec<String>>>, timeout: Duration, pred: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pred(&log.lock().await) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn s1_link_test_issues_no_mux_commands() {
    let h = build_harness().await;
    let now = Local::now();

    let xml = alert_xml(
        "nl.rws.linktest",
        &fmt_ts(now),
        &fmt_ts(now),
        &fmt_ts(now + chrono::Duration::seconds(60)),
        "en-US",
        "link test",
    )
    .replace("<status>Actual</status>", "<status>Test</status>");

    let status = post_xml(&h.app, xml).await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.mux_log.lock().await.is_empty(), "link test must not trigger any mux command");
}

#[tokio::test]
async fn s2_single_active_alert_activates_alarm_and_renders_tts() {
    let h = build_harness().await;
    let now = Local::now();

    let xml = alert_xml(
        "nl.rws.1",
        &fmt_ts(now),
        &fmt_ts(now - chrono::Duration::seconds(5)),
        &fmt_ts(now + chrono::Duration::seconds(60)),
        "nl-NL",
        "Test waarschuwing",
    );
    assert_eq!(post_xml(&h.app, xml).await, StatusCode::OK);

    let activated = wait_for(&h.mux_log, Duration::from_secs(2), |log| {
        log.iter().any(|l| l == "set,alarm,active,1")
    })
    .await;
    assert!(activated, "expected mux to receive set alarm active 1");
    assert!(
        h.mux_log.lock().await.iter().any(|l| l == "set,srv-alarm,label,Alert,Alert"),
        "expected alarm service label swap"
    );

    let wav_path = h.work_dir.path().join("sub-alarm").join("tts.wav");
    let wav_ready = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if wav_path.is_file() {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    assert!(wav_ready, "expected a rendered tts.wav");

    let bytes = tokio::fs::read(&wav_path).await.unwrap();
    assert_eq!(&bytes[0..4], b"RIFF");
    assert_eq!(&bytes[8..12], b"WAVE");
    let data_len = u32::from_le_bytes(bytes[40..44].try_into().unwrap());
    let seconds = data_len as f64 / (48_000.0 * 2.0 * 2.0);
    assert!(seconds >= 1.0, "expected at least 1 s of audio, got {seconds}");
}

#[tokio::test]
async fn s3_expiry_restores_quiet_state() {
    let h = build_harness().await;
    let now = Local::now();

    let xml = alert_xml(
        "nl.rws.2",
        &fmt_ts(now),
        &fmt_ts(now - chrono::Duration::seconds(5)),
        &fmt_ts(now + chrono::Duration::seconds(1)),
        "en-US",
        "short lived warning",
    );
    assert_eq!(post_xml(&h.app, xml).await, StatusCode::OK);

    assert!(wait_for(&h.mux_log, Duration::from_secs(2), |log| log.iter().any(|l| l == "set,alarm,active,1")).await);

    let restored = wait_for(&h.mux_log, Duration::from_secs(4), |log| {
        log.iter().rev().any(|l| l == "set,alarm,active,0")
    })
    .await;
    assert!(restored, "expected mux to receive set alarm active 0 after expiry");
}

#[tokio::test]
async fn s4_cancel_restores_quiet_state() {
    let h = build_harness().await;
    let now = Local::now();
    let sent = fmt_ts(now);

    let xml = alert_xml(
        "nl.rws.3",
        &sent,
        &fmt_ts(now - chrono::Duration::seconds(5)),
        &fmt_ts(now + chrono::Duration::seconds(60)),
        "en-US",
        "cancellable warning",
    );
    assert_eq!(post_xml(&h.app, xml).await, StatusCode::OK);
    assert!(wait_for(&h.mux_log, Duration::from_secs(2), |log| log.iter().any(|l| l == "set,alarm,active,1")).await);

    let cancel = cancel_xml("nl.rws.3.cancel", &fmt_ts(now), &format!("rws@x,nl.rws.3,{sent}"));
    assert_eq!(post_xml(&h.app, cancel).await, StatusCode::OK);

    let restored = wait_for(&h.mux_log, Duration::from_secs(2), |log| {
        log.iter().rev().any(|l| l == "set,alarm,active,0")
    })
    .await;
    assert!(restored, "expected cancel to restore quiet state");
}

#[tokio::test]
async fn s5_data_subchannel_rebroadcasts_framed_alert_bytes() {
    let h = build_harness().await;
    let now = Local::now();

    let xml = alert_xml(
        "nl.rws.4",
        &fmt_ts(now),
        &fmt_ts(now - chrono::Duration::seconds(5)),
        &fmt_ts(now + chrono::Duration::seconds(60)),
        "en-US",
        "data subchannel test",
    );

    // Open the FIFO reader before posting: the pump's sender side only
    // succeeds opening non-blocking once a reader is already present, same
    // as any DAB subchannel's IPC FIFO.
    let fifo_path = h.work_dir.path().join("data1.fifo");
    let open_deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut reader = loop {
        match tokio::net::unix::pipe::OpenOptions::new().open_receiver(&fifo_path) {
            Ok(r) => break r,
            Err(_) if tokio::time::Instant::now() < open_deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("failed to open data subchannel fifo: {e}"),
        }
    };

    assert_eq!(post_xml(&h.app, xml.clone()).await, StatusCode::OK);

    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(2), reader.read(&mut buf))
        .await
        .expect("timed out waiting for framed data")
        .unwrap();
    assert!(n > 0, "expected at least one framed packet");

    // Reverse DAB Packet framing (first-byte size code) then MSC Data
    // Group framing (2-byte header, 2-byte CRC trailer) to recover the
    // original bytes, the same reversal `dab/framer.rs`'s own tests use.
    let mut stream = &buf[..n];
    let mut group = Vec::new();
    while !stream.is_empty() {
        let size = match stream[0] >> 6 {
            0b00 => 24,
            0b01 => 48,
            0b10 => 72,
            0b11 => 96,
            _ => unreachable!(),
        };
        if stream.len() < size {
            break;
        }
        let (packet, rest) = stream.split_at(size);
        let data_len = (packet[2] & 0x7F) as usize;
        group.extend_from_slice(&packet[3..3 + data_len]);
        stream = rest;
    }
    assert!(group.len() > 4, "expected a reassembled MSC group");
    let payload = &group[2..group.len() - 2];
    assert!(
        xml.as_bytes().windows(payload.len()).any(|w| w == payload),
        "expected the framed payload to carry the posted alert bytes byte-for-byte"
    );
}

#[tokio::test]
async fn s6_queue_overflow_accepts_all_but_drops_past_capacity() {
    let stats = Stats::new();
    let (tx, _rx) = tokio::sync::mpsc::channel(2);
    let parser = Arc::new(CapParser::new(true, "cfns.ack", "gateway@test"));
    let state = CapIntakeState::new(parser, tx, stats.clone(), true);
    let app = build_router(state);

    let now = Local::now();
    for i in 0..3 {
        let xml = alert_xml(
            &format!("nl.rws.overflow.{i}"),
            &fmt_ts(now),
            &fmt_ts(now),
            &fmt_ts(now + chrono::Duration::seconds(60)),
            "en-US",
            "overflow test",
        );
        let status = post_xml(&app, xml).await;
        assert_eq!(status, StatusCode::OK, "every POST must still return 200 even once the queue is full");
    }

    assert_eq!(stats.intake_queue_drops.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test]
async fn intake_server_binds_and_serves_health_check() {
    let stats = Stats::new();
    let (tx, _rx) = tokio::sync::mpsc::channel(4);
    let parser = Arc::new(CapParser::new(true, "cfns.ack", "gateway@test"));
    let state = CapIntakeState::new(parser, tx, stats, true);
    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = start_intake_server("127.0.0.1", 0, state, shutdown.clone()).await;
    // Port 0 lets the OS pick a free port; this just confirms the whole
    // bootstrap path (listener bind, router build, graceful shutdown wiring)
    // doesn't panic or error before any request is sent.
    assert!(handle.is_ok());
    shutdown.cancel();
}
