//! Shared data model (spec.md §3).
//!
//! Ownership is by value: `SchedulerState` belongs exclusively to the
//! scheduler task, `StreamDescriptor::runtime` exclusively to its
//! supervisor task. Nothing here is shared via interior mutability across
//! component boundaries — collaborators pass these types over channels.

use chrono::{DateTime, FixedOffset};
use std::collections::BTreeMap;

/// The CAP timestamp format: `YYYY-MM-DDTHH:MM:SS±HH:MM` (colon in offset
/// mandatory). `chrono`'s `%z` accepts `+HHMM`; CAP requires the colon, so
/// callers must use [`parse_cap_timestamp`] rather than chrono's own `%z`.
pub type CapTimestamp = DateTime<FixedOffset>;

/// One `(sender, identifier, sent)` triple, as carried in a `Cancel`'s
/// `<references>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertReference {
    pub sender: String,
    pub identifier: String,
    pub sent: String,
}

/// The normalised form of a CAP message (spec.md §3).
#[derive(Debug, Clone)]
pub enum AlertEvent {
    LinkTest {
        identifier: String,
        sender: String,
        sent: CapTimestamp,
        raw: Vec<u8>,
    },
    Alert {
        identifier: String,
        sender: String,
        sent: CapTimestamp,
        raw: Vec<u8>,
        language: String,
        effective: CapTimestamp,
        expires: CapTimestamp,
        description: String,
    },
    Cancel {
        identifier: String,
        sender: String,
        sent: CapTimestamp,
        raw: Vec<u8>,
        references: Vec<AlertReference>,
    },
}

impl AlertEvent {
    pub fn identifier(&self) -> &str {
        match self {
            AlertEvent::LinkTest { identifier, .. }
            | AlertEvent::Alert { identifier, .. }
            | AlertEvent::Cancel { identifier, .. } => identifier,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            AlertEvent::LinkTest { sender, .. }
            | AlertEvent::Alert { sender, .. }
            | AlertEvent::Cancel { sender, .. } => sender,
        }
    }

    pub fn sent(&self) -> &CapTimestamp {
        match self {
            AlertEvent::LinkTest { sent, .. }
            | AlertEvent::Alert { sent, .. }
            | AlertEvent::Cancel { sent, .. } => sent,
        }
    }

    pub fn raw(&self) -> &[u8] {
        match self {
            AlertEvent::LinkTest { raw, .. }
            | AlertEvent::Alert { raw, .. }
            | AlertEvent::Cancel { raw, .. } => raw,
        }
    }

    /// The `(sender, identifier, sent)` triple used to match `Cancel`
    /// references against live alerts.
    pub fn reference_key(&self) -> AlertReference {
        AlertReference {
            sender: self.sender().to_string(),
            identifier: self.identifier().to_string(),
            sent: self.sent().to_rfc3339(),
        }
    }
}

/// Edge tracker (spec.md §3: `last_broadcast_state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Quiet,
    Warning,
}

/// Singleton owned exclusively by the alert scheduler (C6).
///
/// `pending` is ordered by `effective`, `active` by `expires`, matching the
/// promotion/expiry scans in spec.md §4.6.
#[derive(Debug, Default)]
pub struct SchedulerState {
    pending: Vec<AlertEvent>,
    active: Vec<AlertEvent>,
    pub last_broadcast_state: Option<BroadcastState>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            active: Vec::new(),
            last_broadcast_state: None,
        }
    }

    pub fn pending(&self) -> &[AlertEvent] {
        &self.pending
    }

    pub fn active(&self) -> &[AlertEvent] {
        &self.active
    }

    pub fn push_pending(&mut self, ev: AlertEvent) {
        self.pending.push(ev);
        self.pending.sort_by_key(|e| match e {
            AlertEvent::Alert { effective, .. } => *effective,
            _ => CapTimestamp::default(),
        });
    }

    pub fn push_active(&mut self, ev: AlertEvent) {
        self.active.push(ev);
        self.active.sort_by_key(|e| match e {
            AlertEvent::Alert { expires, .. } => *expires,
            _ => CapTimestamp::default(),
        });
    }

    /// Remove every `active`/`pending` alert whose expiry is at or before
    /// `now`. Returns the count removed, for stats/logging.
    pub fn sweep_expired(&mut self, now: CapTimestamp) -> usize {
        let before = self.active.len();
        self.active.retain(|e| match e {
            AlertEvent::Alert { expires, .. } => *expires > now,
            _ => true,
        });
        before - self.active.len()
    }

    /// Move every pending alert whose `effective` has arrived into `active`.
    pub fn promote_due(&mut self, now: CapTimestamp) {
        let mut i = 0;
        while i < self.pending.len() {
            let due = matches!(&self.pending[i], AlertEvent::Alert { effective, .. } if *effective <= now);
            if due {
                let ev = self.pending.remove(i);
                self.push_active(ev);
            } else {
                i += 1;
            }
        }
    }

    /// Remove any active/pending alert matching one of `refs` exactly.
    /// Returns `true` if at least one reference matched.
    pub fn cancel_matching(&mut self, refs: &[AlertReference]) -> bool {
        let mut matched = false;
        for r in refs {
            let before_active = self.active.len();
            self.active.retain(|e| &e.reference_key() != r);
            if self.active.len() != before_active {
                matched = true;
            }

            let before_pending = self.pending.len();
            self.pending.retain(|e| &e.reference_key() != r);
            if self.pending.len() != before_pending {
                matched = true;
            }
        }
        matched
    }

    pub fn desired_state(&self) -> BroadcastState {
        if self.active.is_empty() {
            BroadcastState::Quiet
        } else {
            BroadcastState::Warning
        }
    }
}

/// DAB subchannel output kind (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    DabAudio,
    DabPlusAudio,
    PacketData,
}

/// DAB subchannel input kind (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    File,
    Fifo,
    GstUri,
}

/// Runtime handles owned exclusively by the stream's supervisor task.
#[derive(Debug, Default)]
pub struct StreamRuntime {
    pub encoder_pid: Option<u32>,
    pub pad_pid: Option<u32>,
    pub ipc_fifo_path: Option<std::path::PathBuf>,
}

/// One configured DAB subchannel (spec.md §3).
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub name: String,
    pub output_kind: OutputKind,
    pub input_kind: InputKind,
    pub input_location: String,
    pub bitrate_kbps: u32,
    pub protection_profile: String,
    pub protection_level: u8,
    pub pad_enabled: bool,
    pub pad_length: u32,
}

impl StreamDescriptor {
    /// Validate the invariants listed in spec.md §3.
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.output_kind == OutputKind::PacketData && self.input_kind == InputKind::GstUri {
            return Err(crate::error::ConfigError::Malformed {
                line: 0,
                msg: format!("stream \"{}\": PacketData may not use GstUri input", self.name),
            });
        }
        if self.bitrate_kbps == 0 || self.bitrate_kbps % 8 != 0 || self.bitrate_kbps > 192 {
            return Err(crate::error::ConfigError::InvalidBitrate(self.bitrate_kbps));
        }
        Ok(())
    }
}

/// A named mux announcement binding (spec.md §3).
#[derive(Debug, Clone)]
pub struct AnnouncementBinding {
    pub name: String,
    pub cluster_id: u8,
    pub flags: Vec<String>,
    pub subchannel: String,
}

/// One service entry within [`EnsembleConfig`].
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub label: String,
    pub short_label: String,
    pub pty: String,
    pub accepts_alarm: bool,
}

/// The multiplexer configuration (spec.md §3). Single source of truth for
/// ensemble topology; subchannels/components are generated from
/// [`StreamDescriptor`]s, never authored here directly.
#[derive(Debug, Clone, Default)]
pub struct EnsembleConfig {
    pub ensemble_id: String,
    pub ecc: String,
    pub label: String,
    pub short_label: String,
    pub services: BTreeMap<String, ServiceConfig>,
    pub announcements: BTreeMap<String, AnnouncementBinding>,
}

impl EnsembleConfig {
    /// Read-only snapshot for the `Warning`-edge restore point (spec.md §5:
    /// "read-only copy taken at the Warning edge").
    pub fn snapshot(&self) -> EnsembleConfig {
        self.clone()
    }
}
