//! TTS and transcode collaborators (grounded on
//! `original_source/dab/watcher.py::DABWatcher.run`'s `pyttsx3` + `ffmpeg`
//! pipeline). Kept behind traits so the switchover component (C7) never
//! introspects which backend produced the WAV, per spec.md §9's rewrite
//! note on TTS backend detection.

use crate::error::TranscodeError;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(20);

/// A TTS backend. Kept generic (not `dyn`) at call sites so `synthesize`
/// can stay a plain `async fn` without boxing its future.
pub trait TtsEngine: Send + Sync {
    /// A backend-specific silence marker, inserted between script segments.
    /// `watcher.py`'s `_slnc` switches on the pyttsx3 driver module; here
    /// the backend owns that choice entirely.
    fn insert_silence(&self, ms: u32) -> String;

    /// Render `text` (already composed, with silence markers) in `language`
    /// to an MP3 at `out_mp3`.
    fn synthesize(
        &self,
        text: &str,
        language: &str,
        out_mp3: &Path,
    ) -> impl std::future::Future<Output = Result<(), TranscodeError>> + Send;
}

/// An audio transcoder. See [`TtsEngine`] for why this stays generic.
pub trait Transcoder: Send + Sync {
    /// Convert `input` to `pcm_s16le`, 48 kHz, stereo WAV at `output`,
    /// bounded to 20 s wall-clock (spec.md §5).
    fn transcode_to_wav(
        &self,
        input: &Path,
        output: &Path,
    ) -> impl std::future::Future<Output = Result<(), TranscodeError>> + Send;
}

/// Shells out to `espeak-ng` (or `espeak`), the common Linux console TTS
/// engine, in lieu of `pyttsx3`'s platform-switching frontend.
pub struct EspeakTtsEngine {
    binary: String,
}

impl EspeakTtsEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for EspeakTtsEngine {
    fn default() -> Self {
        Self::new("espeak-ng")
    }
}

impl TtsEngine for EspeakTtsEngine {
    fn insert_silence(&self, ms: u32) -> String {
        format!("<break time=\"{ms}ms\" />")
    }

    async fn synthesize(&self, text: &str, language: &str, out_mp3: &Path) -> Result<(), TranscodeError> {
        let voice = match language {
            "de-DE" => "de",
            "nl-NL" => "nl",
            _ => "en-us",
        };

        let status = Command::new(&self.binary)
            .arg("-v")
            .arg(voice)
            .arg("-m")
            .arg(text)
            .arg("-w")
            .arg(out_mp3)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| TranscodeError::Synthesis(e.to_string()))?;

        if !status.success() {
            return Err(TranscodeError::Synthesis(format!("espeak exited with {status}")));
        }
        Ok(())
    }
}

/// Shells out to `ffmpeg`, as `watcher.py` does, bounded to 20 s.
pub struct FfmpegTranscoder {
    binary: String,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Transcoder for FfmpegTranscoder {
    async fn transcode_to_wav(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        let mut child = Command::new(&self.binary)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-acodec")
            .arg("pcm_s16le")
            .arg("-ar")
            .arg("48000")
            .arg("-ac")
            .arg("2")
            .arg(output)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| TranscodeError::Failed(e.to_string()))?;

        let result = tokio::time::timeout(TRANSCODE_TIMEOUT, child.wait()).await;
        match result {
            Err(_) => {
                let _ = child.start_kill();
                Err(TranscodeError::Timeout(TRANSCODE_TIMEOUT))
            }
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(TranscodeError::Failed(format!("ffmpeg exited with {status}"))),
            Ok(Err(e)) => Err(TranscodeError::Failed(e.to_string())),
        }
    }
}

/// Compose the TTS script for one tick's active alert set (spec.md §4.7).
pub fn compose_script(tts: &impl TtsEngine, active: &[crate::types::AlertEvent]) -> String {
    let mut script = String::new();

    if active.len() == 1 {
        if let crate::types::AlertEvent::Alert { description, .. } = &active[0] {
            script.push_str(&tts.insert_silence(2000));
            script.push(' ');
            script.push_str(description);
            script.push_str(". ");
            script.push_str(&tts.insert_silence(500));
            script.push_str(" End of message.");
        }
    } else {
        for (i, alert) in active.iter().enumerate() {
            if let crate::types::AlertEvent::Alert { description, .. } = alert {
                script.push_str(&tts.insert_silence(2000));
                script.push_str(&format!(" Message {}. ", i + 1));
                script.push_str(&tts.insert_silence(1000));
                script.push(' ');
                script.push_str(description);
                script.push_str(". ");
                script.push_str(&tts.insert_silence(500));
                script.push_str(&format!(" End of message {}.", i + 1));
            }
        }
    }

    script.push_str(&tts.insert_silence(2000));
    script.push_str(" Repeating.");
    script
}

/// Pick the rendering language for a tick: the first active alert's
/// language if it's one of the three supported locales, else `en-US`.
pub fn select_language(active: &[crate::types::AlertEvent]) -> &'static str {
    const SUPPORTED: [&str; 3] = ["en-US", "de-DE", "nl-NL"];
    if let Some(crate::types::AlertEvent::Alert { language, .. }) = active.first() {
        if let Some(lang) = SUPPORTED.iter().find(|&&l| l == language) {
            return lang;
        }
    }
    "en-US"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CapTimestamp;
    use chrono::DateTime;

    fn alert(description: &str, language: &str) -> crate::types::AlertEvent {
        let ts: CapTimestamp = DateTime::parse_from_rfc3339("2026-01-01T00:00:00+00:00").unwrap();
        crate::types::AlertEvent::Alert {
            identifier: "id".into(),
            sender: "sender".into(),
            sent: ts,
            raw: Vec::new(),
            language: language.into(),
            effective: ts,
            expires: ts,
            description: description.into(),
        }
    }

    #[test]
    fn composes_single_alert_script() {
        let tts = EspeakTtsEngine::default();
        let active = vec![alert("Flood warning", "en-US")];
        let script = compose_script(&tts, &active);
        assert!(script.contains("Flood warning"));
        assert!(script.contains("Repeating"));
    }

    #[test]
    fn composes_multi_alert_script_with_numbered_segments() {
        let tts = EspeakTtsEngine::default();
        let active = vec![alert("Flood warning", "en-US"), alert("Fire warning", "en-US")];
        let script = compose_script(&tts, &active);
        assert!(script.contains("Message 1."));
        assert!(script.contains("Message 2."));
    }

    #[test]
    fn falls_back_to_en_us_for_unsupported_language() {
        let active = vec![alert("x", "fr-FR")];
        assert_eq!(select_language(&active), "en-US");
    }

    #[test]
    fn uses_first_alert_language_when_supported() {
        let active = vec![alert("x", "nl-NL")];
        assert_eq!(select_language(&active), "nl-NL");
    }
}
