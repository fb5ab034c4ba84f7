//! CAP v1.2 validator (C1).
//!
//! Grounded on `original_source/cap/parser.py`: the same required-element
//! lists, the same strict/lenient promotion rule (`logging_strict`), and the
//! same three-way classification (`LinkTest` / `Alert` / `Cancel`) are
//! reproduced element-for-element; only the representation changes (typed
//! `Result` instead of a `bool` return plus print statements).

use crate::error::ParseError;
use crate::types::{AlertEvent, AlertReference, CapTimestamp};
use chrono::DateTime;
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// CAP v1.2 namespace URI.
pub const CAP_NAMESPACE: &str = "urn:oasis:names:tc:emergency:cap:1.2";

/// Defends against billion-laughs-style structural blowups: quick-xml never
/// expands external entities or DTDs, but an attacker can still nest
/// elements arbitrarily deep, so we bound the walk independently.
const MAX_DEPTH: usize = 32;

/// A flattened view of one XML element's direct children: tag name (local,
/// namespace-stripped) → text content. Good enough for CAP's shallow
/// `<alert>`/`<info>` structure; nothing in this schema repeats a child tag
/// with different meaning at the same level.
type Fields = HashMap<String, String>;

struct ParsedDocument {
    root_ns_ok: bool,
    alert: Fields,
    info: Option<Fields>,
    references_text: Option<String>,
}

fn parse_xml_tree(raw: &[u8]) -> Result<ParsedDocument, ParseError> {
    let mut reader = NsReader::from_reader(raw);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut root_ns_ok = false;
    let mut seen_root = false;

    let mut alert = Fields::new();
    let mut info: Option<Fields> = None;
    let mut references_text: Option<String> = None;

    // path[0] = current depth-1 tag (direct child of <alert>), used to know
    // where to file the next Text event, and whether we're inside <info>.
    let mut current_alert_child: Option<String> = None;
    let mut current_info_child: Option<String> = None;
    let mut in_info = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::MalformedXml(e.to_string()))?;

        match event {
            Event::Eof => break,
            Event::Start(ref e) | Event::Empty(ref e) => {
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(ParseError::MalformedXml(format!(
                        "document nesting exceeds {MAX_DEPTH} levels"
                    )));
                }

                let (ns, local) = reader.resolve_element(e.name());
                let local_name = String::from_utf8_lossy(local.as_ref()).to_string();

                if !seen_root {
                    seen_root = true;
                    root_ns_ok = matches!(ns, ResolveResult::Bound(n) if n.as_ref() == CAP_NAMESPACE.as_bytes());
                    if local_name != "alert" {
                        root_ns_ok = false;
                    }
                } else if depth == 2 {
                    if local_name == "info" {
                        in_info = true;
                        info = Some(Fields::new());
                        current_info_child = None;
                    } else {
                        current_alert_child = Some(local_name);
                    }
                } else if depth == 3 && in_info {
                    current_info_child = Some(local_name);
                }

                if matches!(event, Event::Empty(_)) {
                    // Self-closing: no text, no End event will decrement depth.
                    depth -= 1;
                    if depth == 1 {
                        current_alert_child = None;
                    } else if depth == 2 && in_info {
                        current_info_child = None;
                    }
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| ParseError::MalformedXml(e.to_string()))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }

                if depth == 2 {
                    if let Some(child) = &current_alert_child {
                        if child == "references" {
                            references_text = Some(text.clone());
                        }
                        alert.insert(child.clone(), text);
                    }
                } else if depth == 3 && in_info {
                    if let (Some(info_map), Some(child)) = (info.as_mut(), &current_info_child) {
                        info_map.insert(child.clone(), text);
                    }
                }
            }
            Event::End(_) => {
                if depth == 3 && in_info {
                    current_info_child = None;
                } else if depth == 2 {
                    if in_info && current_info_child.is_none() {
                        // closing </info>
                        in_info = false;
                    }
                    current_alert_child = None;
                }
                depth -= 1;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(ParsedDocument {
        root_ns_ok,
        alert,
        info,
        references_text,
    })
}

/// Parse a CAP timestamp under the fixed format
/// `%Y-%m-%dT%H:%M:%S±HH:MM` (colon in the offset mandatory).
pub fn parse_cap_timestamp(s: &str) -> Option<CapTimestamp> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%:z").ok()
}

/// Parse `<references>` text: space-separated `sender,identifier,sent`
/// triples.
fn parse_references(text: &str) -> Result<Vec<AlertReference>, ParseError> {
    let mut out = Vec::new();
    for triple in text.split_whitespace() {
        let parts: Vec<&str> = triple.splitn(3, ',').collect();
        if parts.len() != 3 {
            return Err(ParseError::BadReferences(triple.to_string()));
        }
        out.push(AlertReference {
            sender: parts[0].to_string(),
            identifier: parts[1].to_string(),
            sent: parts[2].to_string(),
        });
    }
    if out.is_empty() {
        return Err(ParseError::BadReferences("empty references".into()));
    }
    Ok(out)
}

/// Log via `tracing::error!` or `tracing::warn!` depending on whether
/// strict parsing is enforced. Returns `true` if the violation is fatal
/// (strict mode), `false` if merely logged (lenient mode).
///
/// Mirrors `cap/parser.py::logging_strict` exactly.
fn strict_violation(strict: bool, msg: &str) -> bool {
    if strict {
        tracing::error!("{msg}");
        true
    } else {
        tracing::warn!("{msg}");
        false
    }
}

/// CAP v1.2 parser/validator and ack generator (C1).
pub struct CapParser {
    strict: bool,
    identifier_prefix: String,
    sender: String,
    ack_counter: AtomicU64,
}

impl CapParser {
    pub fn new(strict: bool, identifier_prefix: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            strict,
            identifier_prefix: identifier_prefix.into(),
            sender: sender.into(),
            ack_counter: AtomicU64::new(0),
        }
    }

    fn check_info_elements(&self, info: &Fields) -> Result<(), ParseError> {
        for e in ["category", "event", "urgency", "severity", "certainty"] {
            if !info.contains_key(e) {
                return Err(ParseError::MissingElement { container: "info", element: leak_static(e) });
            }
        }

        if !info.contains_key("language") {
            if strict_violation(self.strict, "required element missing from <info> container: language") {
                return Err(ParseError::MissingElement { container: "info", element: "language" });
            }
        }

        if let Some(category) = info.get("category") {
            if category != "Safety" {
                tracing::warn!(category = %category, "invalid category");
            }
        }
        for (field, value) in [("urgency", info.get("urgency")), ("severity", info.get("severity")), ("certainty", info.get("certainty"))] {
            if let Some(v) = value {
                if v != "Unknown" {
                    tracing::warn!(field, value = %v, "invalid value, expected Unknown");
                }
            }
        }

        let effective = info.get("effective").ok_or(ParseError::MissingElement { container: "info", element: "effective" })?;
        if parse_cap_timestamp(effective).is_none() {
            return Err(ParseError::BadTimestamp(effective.clone()));
        }
        let expires = info.get("expires").ok_or(ParseError::MissingElement { container: "info", element: "expires" })?;
        if parse_cap_timestamp(expires).is_none() {
            return Err(ParseError::BadTimestamp(expires.clone()));
        }

        Ok(())
    }

    fn check_alert_elements(&self, alert: &Fields, info: &Option<Fields>) -> Result<(), ParseError> {
        for e in ["identifier", "sender", "sent", "status", "msgType", "scope"] {
            if !alert.contains_key(e) {
                return Err(ParseError::MissingElement { container: "alert", element: leak_static(e) });
            }
        }

        let sent = &alert["sent"];
        if parse_cap_timestamp(sent).is_none() {
            return Err(ParseError::BadTimestamp(sent.clone()));
        }

        let msg_type = alert["msgType"].as_str();
        let status = alert["status"].as_str();

        if msg_type == "Alert" && status != "Test" {
            let info = info.as_ref().ok_or(ParseError::MissingElement { container: "alert", element: "info" })?;
            self.check_info_elements(info)?;
        } else if msg_type == "Cancel" && !alert.contains_key("references") {
            if strict_violation(self.strict, "required element missing from <alert> container: references") {
                return Err(ParseError::MissingElement { container: "alert", element: "references" });
            }
        }

        let scope = &alert["scope"];
        if scope != "Public" {
            if strict_violation(self.strict, &format!("invalid scope: {scope}")) {
                return Err(ParseError::InvalidScope(scope.clone()));
            }
        }

        Ok(())
    }

    /// Parse and classify a raw CAP XML document.
    pub fn parse(&self, raw: &[u8]) -> Result<AlertEvent, ParseError> {
        let doc = parse_xml_tree(raw)?;

        if !doc.root_ns_ok {
            if strict_violation(self.strict, "invalid namespace or root element, expected CAP v1.2 <alert>") {
                return Err(ParseError::NamespaceMismatch("root element is not CAPv1.2:alert".into()));
            }
        }

        self.check_alert_elements(&doc.alert, &doc.info)?;

        let identifier = doc.alert["identifier"].clone();
        let sender = doc.alert["sender"].clone();
        let sent = parse_cap_timestamp(&doc.alert["sent"]).expect("validated above");
        let raw_owned = raw.to_vec();

        let msg_type = doc.alert["msgType"].as_str();
        let status = doc.alert["status"].as_str();

        match (msg_type, status) {
            ("Alert", "Test") => Ok(AlertEvent::LinkTest { identifier, sender, sent, raw: raw_owned }),
            ("Alert", _) => {
                let info = doc.info.expect("checked in check_alert_elements");
                let language = info.get("language").cloned().unwrap_or_default();
                let effective = parse_cap_timestamp(&info["effective"]).expect("validated above");
                let expires = parse_cap_timestamp(&info["expires"]).expect("validated above");
                if expires <= effective {
                    return Err(ParseError::BadTimestamp(format!(
                        "expires ({expires}) must be after effective ({effective})"
                    )));
                }
                let description = info.get("description").cloned().unwrap_or_default();
                Ok(AlertEvent::Alert {
                    identifier,
                    sender,
                    sent,
                    raw: raw_owned,
                    language,
                    effective,
                    expires,
                    description,
                })
            }
            ("Cancel", _) => {
                let text = doc.references_text.ok_or(ParseError::BadReferences("missing <references>".into()))?;
                let references = parse_references(&text)?;
                Ok(AlertEvent::Cancel { identifier, sender, sent, raw: raw_owned, references })
            }
            (other, _) => Err(ParseError::UnknownMsgType(other.to_string())),
        }
    }

    /// Generate an `Ack` envelope referencing a received
    /// `(sender, identifier, sent)` triple (spec.md §4.1).
    ///
    /// Identifier format: `<configured-prefix>.<monotonic-counter>`, the
    /// counter persisting for the life of the process.
    pub fn generate_response(&self, sender: &str, identifier: &str, sent: &str) -> Vec<u8> {
        let counter = self.ack_counter.fetch_add(1, Ordering::Relaxed);
        let ack_identifier = format!("{}.{}", self.identifier_prefix, counter);
        let now: CapTimestamp = chrono::Local::now().fixed_offset();
        let sent_ts = format_cap_timestamp(&now);
        let references = format!("{sender},{identifier},{sent}");

        format!(
            "<?xml version='1.0' encoding='UTF-8'?>\n\
             <alert xmlns=\"{ns}\">\
             <identifier>{ack_identifier}</identifier>\
             <sender>{self_sender}</sender>\
             <sent>{sent_ts}</sent>\
             <status>Actual</status>\
             <msgType>Ack</msgType>\
             <scope>Public</scope>\
             <references>{references}</references>\
             </alert>",
            ns = CAP_NAMESPACE,
            self_sender = self.sender,
        )
        .into_bytes()
    }
}

/// Render a timestamp under CAP's fixed format with the mandatory colon in
/// the UTC offset (`chrono`'s `%:z` already does this; kept as a named
/// helper so the format string lives in one place).
pub fn format_cap_timestamp(ts: &CapTimestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// `HashMap` keys above are owned `String`s but `ParseError::MissingElement`
/// wants a `&'static str` to avoid an allocation on the hot "all required
/// fields present" path; this just forwards the known-static literal back
/// through so the match arms above read naturally.
fn leak_static(s: &'static str) -> &'static str {
    s
}
