//! Flat `streams.ini` config wrapper, grounded on
//! `original_source/dab/streamscfg.py::StreamsConfig`: a small INI reader
//! with the same load/save/restore/write checkpoint API, backing the
//! per-subchannel [`StreamDescriptor`](crate::types::StreamDescriptor) set
//! owned by the stream supervisor (C4).

use crate::error::ConfigError;
use crate::types::{InputKind, OutputKind, StreamDescriptor};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

type Section = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct StreamsConfig {
    path: Option<PathBuf>,
    sections: BTreeMap<String, Section>,
    saved: Option<BTreeMap<String, Section>>,
}

impl StreamsConfig {
    /// Load `path`, creating an empty file if it doesn't exist yet (mirrors
    /// `StreamsConfig.load`'s "create a new streams.ini" fallback).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let sections = if path.is_file() {
            parse_ini(&std::fs::read_to_string(&path)?)?
        } else {
            tracing::warn!(path = %path.display(), "streams config not found, creating a new one");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, "")?;
            BTreeMap::new()
        };

        Ok(Self { path: Some(path), sections, saved: None })
    }

    pub fn save(&mut self) {
        self.saved = Some(self.sections.clone());
    }

    pub fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.sections = saved;
        }
    }

    pub fn write(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else { return Ok(()) };
        std::fs::write(path, serialize_ini(&self.sections))?;
        Ok(())
    }

    /// Build the typed [`StreamDescriptor`] set from every `[stream:*]`
    /// section.
    pub fn stream_descriptors(&self) -> Result<Vec<StreamDescriptor>, ConfigError> {
        let mut out = Vec::new();
        for (name, section) in &self.sections {
            let Some(stream_name) = name.strip_prefix("stream:") else { continue };

            let output_kind = match section.get("output_type").map(String::as_str) {
                Some("dab") => OutputKind::DabAudio,
                Some("dabplus") => OutputKind::DabPlusAudio,
                Some("packet") => OutputKind::PacketData,
                Some(other) => return Err(ConfigError::UnknownOutputType(other.to_string())),
                None => return Err(ConfigError::UnknownOutputType("<missing>".to_string())),
            };
            let input_kind = match section.get("input_type").map(String::as_str) {
                Some("file") => InputKind::File,
                Some("fifo") => InputKind::Fifo,
                Some("gst") => InputKind::GstUri,
                _ => InputKind::File,
            };

            let descriptor = StreamDescriptor {
                name: stream_name.to_string(),
                output_kind,
                input_kind,
                input_location: section.get("input").cloned().unwrap_or_default(),
                bitrate_kbps: section.get("bitrate").and_then(|v| v.parse().ok()).unwrap_or(0),
                protection_profile: section.get("protection_profile").cloned().unwrap_or_else(|| "EEP_A".to_string()),
                protection_level: section.get("protection").and_then(|v| v.parse().ok()).unwrap_or(3),
                pad_enabled: section.get("dls_enable").map(|v| v == "yes").unwrap_or(false)
                    && section.get("mot_enable").map(|v| v == "yes").unwrap_or(false),
                pad_length: section.get("pad_length").and_then(|v| v.parse().ok()).unwrap_or(58),
            };
            descriptor.validate()?;
            out.push(descriptor);
        }
        Ok(out)
    }

    /// Overwrite a stream's `[stream:*]` section from a (possibly swapped)
    /// descriptor, e.g. to reroute `input`/`dls_enable` at the Warning edge.
    pub fn set_section(&mut self, stream_name: &str, fields: &[(&str, String)]) {
        let section = self.sections.entry(format!("stream:{stream_name}")).or_default();
        for (k, v) in fields {
            section.insert((*k).to_string(), v.clone());
        }
    }
}

fn parse_ini(text: &str) -> Result<BTreeMap<String, Section>, ConfigError> {
    let mut sections = BTreeMap::new();
    let mut current: Option<String> = None;

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            let Some(end) = line.find(']') else {
                return Err(ConfigError::Malformed { line: lineno + 1, msg: "unterminated section header".into() });
            };
            let name = line[1..end].to_string();
            sections.entry(name.clone()).or_insert_with(Section::new);
            current = Some(name);
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Malformed { line: lineno + 1, msg: format!("expected 'key = value', got {line:?}") });
        };
        let Some(section_name) = &current else {
            return Err(ConfigError::Malformed { line: lineno + 1, msg: "key outside any [section]".into() });
        };
        sections
            .entry(section_name.clone())
            .or_insert_with(Section::new)
            .insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok(sections)
}

fn serialize_ini(sections: &BTreeMap<String, Section>) -> String {
    let mut out = String::new();
    for (name, section) in sections {
        out.push('[');
        out.push_str(name);
        out.push_str("]\n");
        for (k, v) in section {
            out.push_str(k);
            out.push_str(" = ");
            out.push_str(v);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_builds_descriptors() {
        let text = "\
[stream:news]\noutput_type = dabplus\ninput_type = file\ninput = /srv/news.wav\nbitrate = 64\nprotection_profile = EEP_A\nprotection = 3\ndls_enable = yes\nmot_enable = no\n";
        let cfg = StreamsConfig { path: None, sections: parse_ini(text).unwrap(), saved: None };
        let descs = cfg.stream_descriptors().unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].name, "news");
        assert_eq!(descs[0].bitrate_kbps, 64);
        assert!(!descs[0].pad_enabled);
    }

    #[test]
    fn save_and_restore_round_trip() {
        let mut cfg = StreamsConfig::default();
        cfg.set_section("alarm", &[("output_type".into(), "dabplus".into())]);
        cfg.save();
        cfg.set_section("alarm", &[("output_type".into(), "dab".into())]);
        cfg.restore();
        assert_eq!(cfg.sections["stream:alarm"]["output_type"], "dabplus");
    }

    #[test]
    fn rejects_key_outside_section() {
        assert!(parse_ini("bitrate = 64\n").is_err());
    }
}
