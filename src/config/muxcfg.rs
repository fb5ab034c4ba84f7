//! Hierarchical ODR-DabMux config file (the "boost info" format), grounded
//! on `original_source/dab/boost_info_parser.py` (`BoostInfoTree`/
//! `BoostInfoParser`) and `original_source/dab/muxcfg.py` (`ODRMuxConfig`).
//!
//! The wire format: `key value` pairs, `{ ... }` for nested sections,
//! `;` starts a line comment. A key may repeat to build a list of sibling
//! sections (e.g. multiple `subchannels` blocks); this implementation keeps
//! insertion order like the original's `OrderedDict`.

use crate::error::ConfigError;
use crate::types::{AnnouncementBinding, EnsembleConfig, ServiceConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One node of the parsed config tree: an optional scalar value plus an
/// ordered list of named children (children with the same name are
/// siblings, not overwrites — mirrors `BoostInfoTree.subTrees`).
#[derive(Debug, Clone, Default)]
pub struct BoostInfoTree {
    pub value: Option<String>,
    pub children: Vec<(String, BoostInfoTree)>,
}

impl BoostInfoTree {
    pub fn child(&self, key: &str) -> Option<&BoostInfoTree> {
        self.children.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn child_mut(&mut self, key: &str) -> &mut BoostInfoTree {
        if let Some(idx) = self.children.iter().position(|(k, _)| k == key) {
            &mut self.children[idx].1
        } else {
            self.children.push((key.to_string(), BoostInfoTree::default()));
            &mut self.children.last_mut().unwrap().1
        }
    }

    pub fn children_named<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a BoostInfoTree> {
        self.children.iter().filter(move |(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set_value(&mut self, key: &str, value: impl Into<String>) {
        self.child_mut(key).value = Some(value.into());
    }

    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.child(key).and_then(|c| c.value.as_deref())
    }

    fn write_into(&self, out: &mut String, indent: usize, root: bool) {
        for (key, child) in &self.children {
            out.push_str(&" ".repeat(indent));
            out.push_str(key);
            if let Some(v) = &child.value {
                out.push(' ');
                if v.is_empty() || v.contains(char::is_whitespace) {
                    out.push('"');
                    out.push_str(v);
                    out.push('"');
                } else {
                    out.push_str(v);
                }
            }
            if !child.children.is_empty() {
                out.push_str(" {\n");
                child.write_into(out, indent + 4, false);
                out.push_str(&" ".repeat(indent));
                out.push_str("}\n");
            } else {
                out.push('\n');
            }
        }
        let _ = root;
    }
}

/// Navigate to the node at `path` (a sequence of child indices from the
/// root), panicking if the path is stale. Internal to [`parse`], where
/// every path pushed onto `stack` is guaranteed valid at the point of use.
fn node_at<'a>(root: &'a mut BoostInfoTree, path: &[usize]) -> &'a mut BoostInfoTree {
    let mut node = root;
    for &idx in path {
        node = &mut node.children[idx].1;
    }
    node
}

/// Parse the boost-info text format into a [`BoostInfoTree`].
pub fn parse(text: &str) -> Result<BoostInfoTree, ConfigError> {
    let mut root = BoostInfoTree::default();
    let mut stack: Vec<Vec<usize>> = vec![Vec::new()];

    for (lineno, raw_line) in text.lines().enumerate() {
        let mut line = raw_line;
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // A line may carry a key, an opening brace, a closing brace, or
        // `key {` all on one token stream; walk it left to right.
        let mut rest = line;
        while !rest.is_empty() {
            rest = rest.trim_start();
            if rest.is_empty() {
                break;
            }
            if let Some(after) = rest.strip_prefix('}') {
                if stack.len() <= 1 {
                    return Err(ConfigError::Malformed { line: lineno + 1, msg: "unmatched '}'".into() });
                }
                stack.pop();
                rest = after;
                continue;
            }
            if let Some(after) = rest.strip_prefix('{') {
                let top_path = stack.last().unwrap().clone();
                let top = node_at(&mut root, &top_path);
                let Some(last_idx) = top.children.len().checked_sub(1) else {
                    return Err(ConfigError::Malformed { line: lineno + 1, msg: "'{' with no preceding key".into() });
                };
                let mut child_path = top_path;
                child_path.push(last_idx);
                stack.push(child_path);
                rest = after;
                continue;
            }

            let (token, remainder) = take_token(rest);
            if token.is_empty() {
                break;
            }
            let top_path = stack.last().unwrap().clone();
            let top = node_at(&mut root, &top_path);

            // Peek: does a value token follow before the next brace?
            let remainder_trimmed = remainder.trim_start();
            if remainder_trimmed.starts_with('{') || remainder_trimmed.is_empty() {
                top.children.push((token.to_string(), BoostInfoTree::default()));
                rest = remainder_trimmed;
            } else {
                let (value, after_value) = take_token(remainder_trimmed);
                top.children.push((
                    token.to_string(),
                    BoostInfoTree { value: Some(value.to_string()), children: Vec::new() },
                ));
                rest = after_value;
            }
        }
    }

    if stack.len() != 1 {
        return Err(ConfigError::Malformed { line: text.lines().count(), msg: "unclosed '{'".into() });
    }

    Ok(root)
}

/// Pull the next whitespace-delimited token, honouring double quotes.
fn take_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    if s.is_empty() {
        return ("", "");
    }
    if let Some(rest) = s.strip_prefix('"') {
        if let Some(end) = rest.find('"') {
            return (&rest[..end], &rest[end + 1..]);
        }
        return (rest, "");
    }
    let end = s.find(|c: char| c.is_whitespace() || c == '{' || c == '}').unwrap_or(s.len());
    (&s[..end], &s[end..])
}

pub fn serialize(tree: &BoostInfoTree) -> String {
    let mut out = String::new();
    tree.write_into(&mut out, 0, true);
    out
}

/// ODR-DabMux config file wrapper (`ODRMuxConfig` in the original).
pub struct MuxConfig {
    path: PathBuf,
    tree: BoostInfoTree,
    saved: Option<BoostInfoTree>,
}

impl MuxConfig {
    /// Load `path`, or synthesize the same defaults `ODRMuxConfig.load` does
    /// when the file doesn't exist yet.
    pub fn load(path: impl AsRef<Path>, telnet_port: u16) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let tree = if path.is_file() {
            let text = std::fs::read_to_string(&path)?;
            let mut tree = parse(&text)?;
            tree.child_mut("remotecontrol").set_value("telnetport", telnet_port.to_string());
            tree
        } else {
            tracing::warn!(path = %path.display(), "mux config not found, generating defaults");
            default_tree(telnet_port)
        };

        let mut cfg = Self { path, tree, saved: None };
        cfg.write()?;
        Ok(cfg)
    }

    pub fn tree(&self) -> &BoostInfoTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut BoostInfoTree {
        &mut self.tree
    }

    /// Snapshot the current tree (spec.md §5: taken at the Warning edge).
    pub fn save(&mut self) {
        self.saved = Some(self.tree.clone());
    }

    /// Restore the last snapshot taken by [`Self::save`], if any.
    pub fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.tree = saved;
        }
    }

    pub fn write(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serialize(&self.tree))?;
        Ok(())
    }

    /// Project the raw tree into the typed [`EnsembleConfig`] spec.md §3
    /// data model.
    pub fn to_ensemble_config(&self) -> EnsembleConfig {
        let ensemble = self.tree.child("ensemble");
        let ensemble_id = ensemble.and_then(|e| e.value_of("id")).unwrap_or("0x8FFF").to_string();
        let ecc = ensemble.and_then(|e| e.value_of("ecc")).unwrap_or("0xE3").to_string();
        let label = ensemble.and_then(|e| e.value_of("label")).unwrap_or("DAB Ensemble").to_string();
        let short_label = ensemble.and_then(|e| e.value_of("shortlabel")).unwrap_or("DAB").to_string();

        let mut services = BTreeMap::new();
        if let Some(services_tree) = self.tree.child("services") {
            for (name, node) in &services_tree.children {
                services.insert(
                    name.clone(),
                    ServiceConfig {
                        label: node.value_of("label").unwrap_or_default().to_string(),
                        short_label: node.value_of("shortlabel").unwrap_or_default().to_string(),
                        pty: node.value_of("pty").unwrap_or("0").to_string(),
                        accepts_alarm: node
                            .child("announcements")
                            .and_then(|a| a.value_of("Alarm"))
                            .map(|v| v == "true")
                            .unwrap_or(false),
                    },
                );
            }
        }

        let mut announcements = BTreeMap::new();
        if let Some(ann_tree) = ensemble.and_then(|e| e.child("announcements")) {
            for (name, node) in &ann_tree.children {
                let flags = node
                    .child("flags")
                    .map(|f| f.children.iter().filter(|(_, v)| v.value.as_deref() == Some("true")).map(|(k, _)| k.clone()).collect())
                    .unwrap_or_default();
                announcements.insert(
                    name.clone(),
                    AnnouncementBinding {
                        name: name.clone(),
                        cluster_id: node.value_of("cluster").and_then(|v| v.parse().ok()).unwrap_or(1),
                        flags,
                        subchannel: node.value_of("subchannel").unwrap_or_default().to_string(),
                    },
                );
            }
        }

        EnsembleConfig { ensemble_id, ecc, label, short_label, services, announcements }
    }

    /// Write a service's label/short-label/PTY back into the tree (the
    /// `set {service} label`/`set {service} pty` half of the switchover is
    /// issued over the mux control channel separately; this keeps the
    /// on-disk config consistent with what was pushed live).
    pub fn apply_service(&mut self, name: &str, cfg: &ServiceConfig) {
        let services = self.tree.child_mut("services");
        let service = services.child_mut(name);
        service.set_value("label", cfg.label.clone());
        service.set_value("shortlabel", cfg.short_label.clone());
        service.set_value("pty", cfg.pty.clone());
    }

    pub fn set_alarm_active(&mut self, active: bool) {
        self.tree
            .child_mut("ensemble")
            .child_mut("announcements")
            .child_mut("alarm")
            .set_value("active", if active { "1" } else { "0" });
    }
}

fn default_tree(telnet_port: u16) -> BoostInfoTree {
    let mut root = BoostInfoTree::default();

    let general = root.child_mut("general");
    general.set_value("dabmode", "1");
    general.set_value("nbframes", "0");
    general.set_value("syslog", "false");
    general.set_value("tist", "false");
    general.set_value("managementport", "0");

    root.child_mut("remotecontrol").set_value("telnetport", telnet_port.to_string());

    let ensemble = root.child_mut("ensemble");
    ensemble.set_value("id", "0x8FFF");
    ensemble.set_value("ecc", "0xE3");
    ensemble.set_value("local-time-offset", "auto");
    ensemble.set_value("international-table", "1");
    ensemble.set_value("reconfig-counter", "hash");
    ensemble.set_value("label", "DAB Ensemble");
    ensemble.set_value("shortlabel", "DAB");

    let alarm = ensemble.child_mut("announcements").child_mut("alarm");
    alarm.child_mut("flags").set_value("Alarm", "true");
    alarm.set_value("subchannel", "sub-alarm");
    alarm.set_value("cluster", "1");
    alarm.set_value("active", "0");

    let srv = root.child_mut("services").child_mut("srv-alarm");
    srv.set_value("id", "0x8AAA");
    srv.set_value("label", "Alarm announcement");
    srv.set_value("shortlabel", "Alarm");
    srv.set_value("pty", "3");
    srv.set_value("pty-sd", "static");
    srv.child_mut("announcements").set_value("Alarm", "true");
    srv.child_mut("announcements").set_value("clusters", "1");

    let sub = root.child_mut("subchannels").child_mut("sub-alarm");
    sub.set_value("type", "dabplus");
    sub.set_value("bitrate", "96");
    sub.set_value("id", "1");
    sub.set_value("protection-profile", "EEP_A");
    sub.set_value("protection", "3");
    sub.set_value("inputproto", "zmq");
    sub.set_value("inputuri", "tcp://*:39801");
    sub.set_value("zmq-buffer", "40");
    sub.set_value("zmq-prebuffering", "20");

    let comp = root.child_mut("components").child_mut("comp-alarm");
    comp.set_value("type", "2");
    comp.set_value("service", "srv-alarm");
    comp.set_value("subchannel", "sub-alarm");
    comp.child_mut("user-applications").set_value("userapp", "slideshow");

    root.child_mut("outputs").set_value("stdout", "fifo:///dev/stdout?type=raw");

    root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_braces_and_comments() {
        let text = "\
general {\n    dabmode 1 ; transmission mode\n}\nensemble {\n    id 0x8FFF\n    label \"DAB Ensemble\"\n}\n";
        let tree = parse(text).unwrap();
        assert_eq!(tree.child("general").unwrap().value_of("dabmode"), Some("1"));
        assert_eq!(tree.child("ensemble").unwrap().value_of("label"), Some("DAB Ensemble"));
    }

    #[test]
    fn roundtrips_through_serialize_and_parse() {
        let tree = default_tree(2222);
        let text = serialize(&tree);
        let reparsed = parse(&text).unwrap();
        assert_eq!(reparsed.child("ensemble").unwrap().value_of("id"), Some("0x8FFF"));
        assert_eq!(
            reparsed
                .child("services")
                .unwrap()
                .child("srv-alarm")
                .unwrap()
                .value_of("label"),
            Some("Alarm announcement")
        );
    }

    #[test]
    fn unmatched_closing_brace_is_an_error() {
        assert!(parse("general { }\n}\n").is_err());
    }

    #[test]
    fn to_ensemble_config_reads_default_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dabmux.cfg");
        let tree = default_tree(2222);
        let text = serialize(&tree);
        std::fs::write(&path, &text).unwrap();
        let cfg = MuxConfig::load(&path, 2222).unwrap();
        let ensemble = cfg.to_ensemble_config();
        assert_eq!(ensemble.ensemble_id, "0x8FFF");
        assert!(ensemble.services.contains_key("srv-alarm"));
        assert!(ensemble.services["srv-alarm"].accepts_alarm);
        assert!(ensemble.announcements.contains_key("alarm"));
    }
}
