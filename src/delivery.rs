//! Client-side delivery of new alerts.
//!
//! [`DeliveryClient`] owns everything the operator-facing client remembers:
//! channel toggles, poll checkpoints, the ids already surfaced in this
//! process, badge counters and a short list of recent alerts. It is created
//! with [`DeliveryClient::init`] and torn down with [`DeliveryClient::dispose`];
//! all mutation goes through `&mut self`.

use crate::alerts::{AlertError, DesktopNotifier, Permission, SoundChain, SoundToggles};
use crate::classify::{classify, display_text, Classified};
use crate::ids::dedup_key;
use crate::models::{AlertKind, Notification, RawMessage, StreamKind};
use crate::poller::PollOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Individual desktop notifications per batch; the rest go into one summary
pub const MAX_DESKTOP_NOTIFICATIONS: usize = 3;

/// Length of the recent-alerts list
pub const RECENT_LIMIT: usize = 50;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings file malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client-local settings, persisted as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeliverySettings {
    pub api_key: Option<String>,
    pub upstream_base_url: Option<String>,
    pub poll_interval_secs: u64,
    pub sound_enabled: bool,
    pub pc_beep_enabled: bool,
    pub desktop_notifications_enabled: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_cancellation_checked: Option<DateTime<Utc>>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            api_key: None,
            upstream_base_url: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            sound_enabled: true,
            pc_beep_enabled: true,
            desktop_notifications_enabled: false,
            last_checked: None,
            last_cancellation_checked: None,
        }
    }
}

impl DeliverySettings {
    /// Load settings; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// An item the client can alert on
pub trait Alertable {
    /// Shared by every copy of the same upstream message
    fn alert_key(&self) -> String;
    /// Cabinet name, or its external id when the name is unknown
    fn cabinet(&self) -> &str;
    fn body(&self) -> String;
}

impl<T: Alertable + ?Sized> Alertable for &T {
    fn alert_key(&self) -> String {
        (**self).alert_key()
    }

    fn cabinet(&self) -> &str {
        (**self).cabinet()
    }

    fn body(&self) -> String {
        (**self).body()
    }
}

impl Alertable for RawMessage {
    fn alert_key(&self) -> String {
        dedup_key(self)
    }

    fn cabinet(&self) -> &str {
        if self.cabinet_name.is_empty() {
            &self.cabinet_id
        } else {
            &self.cabinet_name
        }
    }

    fn body(&self) -> String {
        display_text(&self.message)
    }
}

impl Alertable for Notification {
    fn alert_key(&self) -> String {
        self.id.to_string()
    }

    fn cabinet(&self) -> &str {
        if self.cabinet_name.is_empty() {
            &self.cabinet_id
        } else {
            &self.cabinet_name
        }
    }

    fn body(&self) -> String {
        self.display_message.clone()
    }
}

/// Output channels of the client
pub struct DeliveryChannels {
    pub sound: SoundChain,
    pub desktop: Box<dyn DesktopNotifier>,
}

/// Entry of the recent-alerts list
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentAlert {
    pub key: String,
    pub kind: AlertKind,
    pub title: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// What one `add_*` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Items not seen before in this process
    pub new_items: usize,
    /// Desktop notifications shown, summary included
    pub desktop_shown: usize,
    pub summary_shown: bool,
    /// Sound strategy that played, if any
    pub sound: Option<&'static str>,
}

/// What [`DeliveryClient::deliver_outcome`] did, per stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeReport {
    pub notifications: DeliveryReport,
    pub cancellations: DeliveryReport,
}

pub struct DeliveryClient {
    settings_path: PathBuf,
    settings: DeliverySettings,
    channels: DeliveryChannels,
    seen_notifications: HashSet<String>,
    seen_cancellations: HashSet<String>,
    has_interacted: bool,
    unread_notifications: usize,
    unread_cancellations: usize,
    recent: VecDeque<RecentAlert>,
}

impl DeliveryClient {
    /// Load persisted settings and take ownership of the channels. Unreadable
    /// settings fall back to the defaults.
    pub fn init(settings_path: impl Into<PathBuf>, channels: DeliveryChannels) -> Self {
        let settings_path = settings_path.into();
        let settings = DeliverySettings::load(&settings_path).unwrap_or_else(|e| {
            warn!(path = %settings_path.display(), error = %e, "Ignoring unreadable alert settings");
            DeliverySettings::default()
        });

        info!(
            sound = settings.sound_enabled,
            pc_beep = settings.pc_beep_enabled,
            desktop = settings.desktop_notifications_enabled,
            "Delivery client initialized"
        );

        Self {
            settings_path,
            settings,
            channels,
            seen_notifications: HashSet::new(),
            seen_cancellations: HashSet::new(),
            has_interacted: false,
            unread_notifications: 0,
            unread_cancellations: 0,
            recent: VecDeque::with_capacity(RECENT_LIMIT),
        }
    }

    /// Persist settings and release the channels.
    pub fn dispose(self) -> Result<(), SettingsError> {
        self.settings.save(&self.settings_path)?;
        info!("Delivery client disposed");
        Ok(())
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    fn persist(&self) {
        if let Err(e) = self.settings.save(&self.settings_path) {
            warn!(path = %self.settings_path.display(), error = %e, "Failed to save alert settings");
        }
    }

    // === Interaction & toggles ===

    /// The operator did something (key press); unlocks sound.
    pub fn record_interaction(&mut self) {
        if !self.has_interacted {
            debug!("First interaction, sound unlocked");
        }
        self.has_interacted = true;
    }

    pub fn has_interacted(&self) -> bool {
        self.has_interacted
    }

    pub fn set_sound_enabled(&mut self, enabled: bool) {
        self.settings.sound_enabled = enabled;
        self.persist();
    }

    pub fn set_pc_beep_enabled(&mut self, enabled: bool) {
        self.settings.pc_beep_enabled = enabled;
        self.persist();
    }

    /// Toggle desktop notifications. Permission is requested here, the first
    /// time the channel is enabled, and never earlier.
    pub fn set_desktop_notifications_enabled(&mut self, enabled: bool) -> Permission {
        let mut permission = self.channels.desktop.permission();
        if enabled && permission == Permission::Default {
            permission = self.channels.desktop.request_permission();
            info!(?permission, "Desktop notification permission requested");
        }

        self.settings.desktop_notifications_enabled = enabled && permission == Permission::Granted;
        self.persist();
        permission
    }

    // === Checkpoints ===

    pub fn checkpoint(&self, stream: StreamKind) -> Option<DateTime<Utc>> {
        match stream {
            StreamKind::Notifications => self.settings.last_checked,
            StreamKind::Cancellations => self.settings.last_cancellation_checked,
        }
    }

    /// Move a stream's checkpoint forward; older values are ignored.
    pub fn mark_checked(&mut self, stream: StreamKind, at: DateTime<Utc>) {
        let slot = match stream {
            StreamKind::Notifications => &mut self.settings.last_checked,
            StreamKind::Cancellations => &mut self.settings.last_cancellation_checked,
        };
        if slot.is_some_and(|current| current >= at) {
            return;
        }
        *slot = Some(at);
        self.persist();
    }

    // === Badges & recent list ===

    pub fn unread_badge(&self, stream: StreamKind) -> usize {
        match stream {
            StreamKind::Notifications => self.unread_notifications,
            StreamKind::Cancellations => self.unread_cancellations,
        }
    }

    /// The operator looked at a stream; clears its badge.
    pub fn acknowledge(&mut self, stream: StreamKind) {
        match stream {
            StreamKind::Notifications => self.unread_notifications = 0,
            StreamKind::Cancellations => self.unread_cancellations = 0,
        }
    }

    /// Most recent first
    pub fn recent(&self) -> impl Iterator<Item = &RecentAlert> {
        self.recent.iter()
    }

    // === Delivery ===

    pub fn add_notifications<T: Alertable>(&mut self, batch: &[T]) -> DeliveryReport {
        self.deliver(StreamKind::Notifications, batch)
    }

    pub fn add_cancellations<T: Alertable>(&mut self, batch: &[T]) -> DeliveryReport {
        self.deliver(StreamKind::Cancellations, batch)
    }

    /// Hand one poll outcome to the operator.
    ///
    /// Cancellations are global and alert straight from the polled messages.
    /// Notifications alert only through `routed`, the caller's unread copies
    /// as the session router assigned them on the server; upstream messages
    /// for cabinets outside the caller's work session never alert.
    pub fn deliver_outcome(
        &mut self,
        outcome: &PollOutcome,
        routed: &[Notification],
    ) -> OutcomeReport {
        if let Some(checkpoint) = outcome.checkpoint {
            self.mark_checked(outcome.stream, checkpoint);
        }

        let cancellations: Vec<&RawMessage> = outcome
            .messages
            .iter()
            .filter_map(|m| match classify(m, outcome.stream) {
                Classified::Cancellation(m) => Some(m),
                Classified::Notification(_) => None,
            })
            .collect();

        OutcomeReport {
            notifications: self.add_notifications(routed),
            cancellations: self.add_cancellations(cancellations.as_slice()),
        }
    }

    fn deliver<T: Alertable>(&mut self, stream: StreamKind, batch: &[T]) -> DeliveryReport {
        let seen = match stream {
            StreamKind::Notifications => &mut self.seen_notifications,
            StreamKind::Cancellations => &mut self.seen_cancellations,
        };
        let fresh: Vec<(String, &T)> = batch
            .iter()
            .filter_map(|m| {
                let key = m.alert_key();
                seen.insert(key.clone()).then_some((key, m))
            })
            .collect();

        let mut report = DeliveryReport {
            new_items: fresh.len(),
            ..Default::default()
        };
        if fresh.is_empty() {
            return report;
        }

        let kind = match stream {
            StreamKind::Notifications => AlertKind::Notification,
            StreamKind::Cancellations => AlertKind::Cancellation,
        };
        let alerts: Vec<RecentAlert> = fresh
            .into_iter()
            .map(|(key, m)| RecentAlert {
                key,
                kind,
                title: alert_title(kind, m.cabinet()),
                body: m.body(),
                received_at: Utc::now(),
            })
            .collect();

        self.show_desktop(stream, &alerts, &mut report);
        report.sound = self.play_sound();

        match stream {
            StreamKind::Notifications => self.unread_notifications += alerts.len(),
            StreamKind::Cancellations => self.unread_cancellations += alerts.len(),
        }
        for alert in alerts {
            self.recent.push_front(alert);
        }
        self.recent.truncate(RECENT_LIMIT);

        info!(
            stream = %stream,
            new = report.new_items,
            desktop = report.desktop_shown,
            sound = report.sound.unwrap_or("none"),
            "Delivered alerts"
        );
        report
    }

    fn show_desktop(&mut self, stream: StreamKind, alerts: &[RecentAlert], report: &mut DeliveryReport) {
        if !self.settings.desktop_notifications_enabled
            || self.channels.desktop.permission() != Permission::Granted
        {
            return;
        }

        for alert in alerts.iter().take(MAX_DESKTOP_NOTIFICATIONS) {
            match self.channels.desktop.show(&alert.title, &alert.body) {
                Ok(()) => report.desktop_shown += 1,
                Err(e) => debug!(error = %e, "Desktop notification failed"),
            }
        }

        if alerts.len() > MAX_DESKTOP_NOTIFICATIONS {
            let rest = alerts.len() - MAX_DESKTOP_NOTIFICATIONS;
            let title = match stream {
                StreamKind::Notifications => "New notifications",
                StreamKind::Cancellations => "New cancellations",
            };
            match self.channels.desktop.show(title, &format!("{rest} more")) {
                Ok(()) => {
                    report.desktop_shown += 1;
                    report.summary_shown = true;
                }
                Err(e) => debug!(error = %e, "Summary notification failed"),
            }
        }
    }

    fn play_sound(&mut self) -> Option<&'static str> {
        if !self.has_interacted {
            debug!("No interaction yet, sound suppressed");
            return None;
        }

        let toggles = SoundToggles {
            sound_enabled: self.settings.sound_enabled,
            pc_beep_enabled: self.settings.pc_beep_enabled,
        };
        match self.channels.sound.play(toggles) {
            Ok(name) => Some(name),
            Err(AlertError::Disabled) => None,
            Err(e) => {
                warn!(error = %e, "No sound alert could be played");
                None
            }
        }
    }
}

fn alert_title(kind: AlertKind, cabinet: &str) -> String {
    match (kind, cabinet.is_empty()) {
        (AlertKind::Notification, true) => "Notification".to_string(),
        (AlertKind::Notification, false) => cabinet.to_string(),
        (AlertKind::Cancellation, true) => "Cancellation".to_string(),
        (AlertKind::Cancellation, false) => format!("Cancellation: {cabinet}"),
    }
}
