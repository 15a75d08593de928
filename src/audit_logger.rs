//! Structured audit logging for admission decisions and operator actions.
//!
//! Events are serialised to JSON and written asynchronously via an unbounded
//! channel so request handlers never wait on disk. The writer task drains the
//! channel and appends each event to the configured file, or stderr.

use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::config::LoggingConfig;
use crate::suspicious::FlagReason;

/// Security-relevant audit events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Fixed-window quota exhausted
    RateLimitHit {
        ip: String,
        endpoint: String,
        limit: u32,
    },
    /// Request rejected by the content check
    AbuseBlocked {
        ip: String,
        path: String,
        location: String,
    },
    /// Key crossed a suspicion threshold
    KeyFlagged { key: String, reason: FlagReason },
    /// Key denied by the block gate
    KeyBlocked {
        key: String,
        reason: FlagReason,
        path: String,
    },
    /// Block lifted by an operator
    KeyUnblocked {
        key: String,
        ip: String,
        was_blocked: bool,
    },
    /// Per-endpoint rule changed
    RuleUpdated {
        ip: String,
        endpoint: String,
        max_requests: u32,
        window_ms: u64,
    },
    /// Admin authentication failure
    AdminAuthFailure {
        ip: String,
        reason: String,
        attempt: u32,
    },
    /// Shared-secret unblock attempt
    EmergencyUnblock {
        ip: String,
        key: Option<String>,
        success: bool,
    },
    /// Configuration reloaded
    ConfigReload { success: bool },
}

/// Wrapper with metadata added at emission time
#[derive(Serialize)]
struct AuditRecord {
    timestamp: String,
    level: &'static str,
    category: &'static str,
    #[serde(flatten)]
    event: AuditEvent,
}

impl AuditEvent {
    fn level(&self) -> &'static str {
        match self {
            Self::AbuseBlocked { .. }
            | Self::KeyFlagged { .. }
            | Self::KeyBlocked { .. }
            | Self::AdminAuthFailure { .. }
            | Self::EmergencyUnblock { success: false, .. }
            | Self::ConfigReload { success: false } => "WARN",
            _ => "INFO",
        }
    }

    fn category(&self) -> &'static str {
        match self {
            Self::RateLimitHit { .. } => "rate_limit",
            Self::AbuseBlocked { .. } => "abuse",
            Self::KeyFlagged { .. } | Self::KeyBlocked { .. } => "suspicious",
            Self::KeyUnblocked { .. } | Self::RuleUpdated { .. } => "admin",
            Self::AdminAuthFailure { .. } | Self::EmergencyUnblock { .. } => "auth",
            Self::ConfigReload { .. } => "config",
        }
    }
}

/// Async audit logger
pub struct AuditLogger {
    tx: mpsc::UnboundedSender<AuditEvent>,
    /// Background writer task (kept alive as long as the logger is alive)
    _task: Option<Arc<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Create an audit logger writing to the path in `logging_config`, or stderr if None.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(logging_config: &LoggingConfig) -> Self {
        if !logging_config.audit_log_enabled {
            return Self::disabled();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        let path = logging_config.audit_log_path.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let record = AuditRecord {
                    timestamp: Utc::now().to_rfc3339(),
                    level: event.level(),
                    category: event.category(),
                    event,
                };

                match serde_json::to_string(&record) {
                    Ok(mut line) => {
                        line.push('\n');
                        if let Some(ref p) = path {
                            match OpenOptions::new().create(true).append(true).open(p) {
                                Ok(mut f) => {
                                    if let Err(e) = f.write_all(line.as_bytes()) {
                                        error!("audit_logger: write error: {}", e);
                                    }
                                }
                                Err(e) => {
                                    error!("audit_logger: open {:?} error: {}", p, e);
                                    eprint!("{}", line);
                                }
                            }
                        } else {
                            eprint!("{}", line);
                        }
                    }
                    Err(e) => warn!("audit_logger: serialisation error: {}", e),
                }
            }
        });

        Self {
            tx,
            _task: Some(Arc::new(task)),
        }
    }

    /// Logger that discards every event
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx, _task: None }
    }

    /// Submit an audit event (non-blocking).
    pub fn log(&self, event: AuditEvent) {
        // Receiver gone (disabled or shut down): drop silently
        let _ = self.tx.send(event);
    }

    pub fn log_flagged(&self, key: &str, reason: FlagReason) {
        self.log(AuditEvent::KeyFlagged {
            key: key.to_string(),
            reason,
        });
    }

    pub fn log_auth_failure(&self, ip: &str, reason: impl Into<String>, attempt: u32) {
        self.log(AuditEvent::AdminAuthFailure {
            ip: ip.to_string(),
            reason: reason.into(),
            attempt,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_record_shape() {
        let event = AuditEvent::KeyFlagged {
            key: "u1".to_string(),
            reason: FlagReason::RepeatedFailures,
        };
        let record = AuditRecord {
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            level: event.level(),
            category: event.category(),
            event,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["event"], "key_flagged");
        assert_eq!(value["reason"], "repeated_failures");
        assert_eq!(value["category"], "suspicious");
        assert_eq!(value["level"], "WARN");
    }

    #[tokio::test]
    async fn test_events_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::new(&LoggingConfig {
            audit_log_path: Some(path.clone()),
            ..LoggingConfig::default()
        });

        logger.log(AuditEvent::RateLimitHit {
            ip: "10.0.0.1".to_string(),
            endpoint: "/api/submit".to_string(),
            limit: 5,
        });
        logger.log_auth_failure("10.0.0.2", "invalid token", 1);

        let mut content = String::new();
        for _ in 0..100 {
            content = std::fs::read_to_string(&path).unwrap_or_default();
            if content.lines().count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "rate_limit_hit");
        assert_eq!(lines[1]["event"], "admin_auth_failure");
    }

    #[test]
    fn test_disabled_logger_accepts_events() {
        let logger = AuditLogger::disabled();
        logger.log(AuditEvent::ConfigReload { success: true });
    }
}
