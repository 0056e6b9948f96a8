/// Per-session audit log.
///
/// Each session prints one block to stdout once its accept/reject decision is
/// made; that block is part of the server's observable contract. When a log
/// file is configured the same record is appended as a JSON line. Diagnostic
/// output goes through `tracing` and never touches stdout.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, trace};

use crate::wire::Command;

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Accept => "Accept",
            Decision::Reject => "Reject",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: u64,
    pub source_ip: String,
    pub source_port: u16,
    /// Resolved destination, or the requested host when resolution failed.
    pub dest_ip: String,
    pub dest_port: u16,
    pub command: &'static str,
    pub reply: Decision,
}

impl SessionRecord {
    pub fn new(
        session_id: u64,
        source: SocketAddr,
        dest_ip: String,
        dest_port: u16,
        command: Command,
        reply: Decision,
    ) -> Self {
        SessionRecord {
            timestamp: Utc::now(),
            session_id,
            source_ip: source.ip().to_string(),
            source_port: source.port(),
            dest_ip,
            dest_port,
            command: command.as_str(),
            reply,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit sink
// ---------------------------------------------------------------------------

pub struct Audit {
    writer: Mutex<Option<BufWriter<File>>>,
}

impl Audit {
    pub fn new(log_path: Option<&Path>) -> Result<Self> {
        let writer = match log_path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(BufWriter::new(file))
            }
            None => None,
        };
        Ok(Audit {
            writer: Mutex::new(writer),
        })
    }

    /// Print the contract block and append the JSON record when configured.
    pub fn record(&self, record: &SessionRecord) {
        println!(
            "<S_IP>: {}\n<S_PORT>: {}\n<D_IP>: {}\n<D_PORT>: {}\n<Command>: {}\n<Reply>: {}",
            record.source_ip,
            record.source_port,
            record.dest_ip,
            record.dest_port,
            record.command,
            record.reply.as_str(),
        );

        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to serialize session record: {}", e);
                return;
            }
        };
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(ref mut w) = *guard {
                let _ = writeln!(w, "{}", line);
                let _ = w.flush();
            }
        }
    }
}

/// Hex dump of wire bytes at TRACE level.
pub fn trace_dump(direction: &str, data: &[u8]) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let hex: String = data
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");
        trace!(direction, len = data.len(), hex = %hex, "wire bytes");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{IpAddr, Ipv4Addr};

    fn record() -> SessionRecord {
        SessionRecord::new(
            7,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 40123),
            "140.113.1.2".to_string(),
            80,
            Command::Connect,
            Decision::Accept,
        )
    }

    #[test]
    fn test_audit_without_file() {
        let audit = Audit::new(None).unwrap();
        // Should not panic
        audit.record(&record());
    }

    #[test]
    fn test_audit_to_file() {
        let path = std::env::temp_dir().join(format!("sockd_test_audit_{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let audit = Audit::new(Some(&path)).unwrap();
        audit.record(&record());
        drop(audit);

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert!(content.contains("\"source_ip\":\"10.0.0.9\""));
        assert!(content.contains("\"dest_ip\":\"140.113.1.2\""));
        assert!(content.contains("\"command\":\"CONNECT\""));
        assert!(content.contains("\"reply\":\"Accept\""));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_decision_labels() {
        assert_eq!(Decision::Accept.as_str(), "Accept");
        assert_eq!(Decision::Reject.as_str(), "Reject");
    }
}
