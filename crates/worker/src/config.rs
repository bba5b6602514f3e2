//! Notification and producer configuration.

use serde::{Deserialize, Serialize};

/// Which sinks the hub starts with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Publish every job event to the notify destination
    #[serde(default = "default_true")]
    pub broker_reporter: bool,
    /// Write every job event to the log
    #[serde(default = "default_true")]
    pub log_reporter: bool,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
}

fn default_true() -> bool {
    true
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            broker_reporter: true,
            log_reporter: true,
            email: EmailConfig::default(),
            smtp: SmtpConfig::default(),
        }
    }
}

/// Email sink addressing. `to` and `cc` are comma-separated lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub cc: String,
    #[serde(default = "default_from")]
    pub from: String,
    #[serde(default = "default_subject")]
    pub subject: String,
}

fn default_from() -> String {
    "noreply@policetracker.local".to_string()
}

fn default_subject() -> String {
    "Stop and search ingest".to_string()
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            to: String::new(),
            cc: String::new(),
            from: default_from(),
            subject: default_subject(),
        }
    }
}

impl EmailConfig {
    pub fn recipients(&self) -> Vec<String> {
        split_addresses(&self.to)
    }

    pub fn cc_recipients(&self) -> Vec<String> {
        split_addresses(&self.cc)
    }

    /// No `to` address means the email sink stays quiet.
    pub fn has_recipients(&self) -> bool {
        !self.recipients().is_empty()
    }
}

fn split_addresses(list: &str) -> Vec<String> {
    list.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
}

fn default_smtp_host() -> String {
    "mailhog".to_string()
}

fn default_smtp_port() -> u16 {
    1025
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
        }
    }
}

/// Job discovery for the one-shot enqueue mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// First month to enqueue, `YYYY-MM`
    #[serde(default = "default_start_month")]
    pub start_month: String,
    /// Comma-separated force ids
    #[serde(default = "default_forces")]
    pub forces: String,
}

fn default_start_month() -> String {
    "2022-07".to_string()
}

fn default_forces() -> String {
    "metropolitan,west-midlands,city-of-london,avon-and-somerset".to_string()
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            start_month: default_start_month(),
            forces: default_forces(),
        }
    }
}

impl ProducerConfig {
    pub fn force_list(&self) -> Vec<String> {
        split_addresses(&self.forces)
    }
}
