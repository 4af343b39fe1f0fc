//! Audit trail of engine activity.
//!
//! An [`AuditLog`] subscribes to a session's [`EngineEvent`]s. The console
//! kind forwards them to tracing under the `rulebridge::audit` target; the
//! file kind appends one JSON line per event.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{AuditConfig, AuditKind};
use crate::engine::{EngineEvent, EngineEventListener};
use crate::error::{HandlerError, HandlerResult};

pub const DEFAULT_AUDIT_LOG: &str = "audit.log";

enum AuditSink {
    Console,
    File {
        path: PathBuf,
        writer: Mutex<Option<BufWriter<File>>>,
    },
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a EngineEvent,
}

pub struct AuditLog {
    session_id: String,
    sink: AuditSink,
}

impl AuditLog {
    pub fn console(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            sink: AuditSink::Console,
        }
    }

    pub fn file(session_id: &str, path: PathBuf) -> HandlerResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| HandlerError::audit(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            session_id: session_id.to_string(),
            sink: AuditSink::File {
                path,
                writer: Mutex::new(Some(BufWriter::new(file))),
            },
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Flushes and releases the sink. Later events are dropped.
    pub fn close(&self) {
        if let AuditSink::File { path, writer } = &self.sink {
            let Ok(mut writer) = writer.lock() else {
                return;
            };
            if let Some(mut w) = writer.take() {
                if let Err(e) = w.flush() {
                    warn!("Failed to flush audit log {}: {}", path.display(), e);
                }
            }
        }
    }

    fn write_line(&self, event: &EngineEvent) -> std::io::Result<()> {
        let AuditSink::File { writer, .. } = &self.sink else {
            return Ok(());
        };
        let record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };
        let line = serde_json::to_string(&record)?;
        let mut writer = writer
            .lock()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        if let Some(w) = writer.as_mut() {
            writeln!(w, "{}", line)?;
        }
        Ok(())
    }
}

impl EngineEventListener for AuditLog {
    fn on_event(&self, event: &EngineEvent) {
        match &self.sink {
            AuditSink::Console => {
                info!(target: "rulebridge::audit", session = %self.session_id, ?event);
            }
            AuditSink::File { path, .. } => {
                if let Err(e) = self.write_line(event) {
                    warn!("Audit write to {} failed: {}", path.display(), e);
                }
            }
        }
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        self.close();
    }
}

/// Closes the wrapped audit log when dropped, whatever path the caller leaves by.
pub struct AuditGuard(Option<Arc<AuditLog>>);

impl AuditGuard {
    pub fn new(log: Option<Arc<AuditLog>>) -> Self {
        Self(log)
    }

    pub fn log(&self) -> Option<&Arc<AuditLog>> {
        self.0.as_ref()
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if let Some(log) = self.0.take() {
            log.close();
        }
    }
}

/// Creates the audit log configured for a session, if any.
pub fn open_audit_log(
    config: Option<&AuditConfig>,
    session_id: &str,
) -> HandlerResult<Option<Arc<AuditLog>>> {
    let Some(config) = config else {
        return Ok(None);
    };
    let log = match config.kind {
        AuditKind::Console => AuditLog::console(session_id),
        AuditKind::File => AuditLog::file(
            session_id,
            config
                .log
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_LOG)),
        )?,
    };
    Ok(Some(Arc::new(log)))
}
