//! Destinations for pulled threat events.
//!
//! Each event is emitted as its attribute object serialized to one line of
//! JSON:
//!
//! - file: appended, one event per line;
//! - syslog: one RFC 3164 datagram per event over UDP, priority `<14>`
//!   (facility user, severity informational).
//!
//! Both may be active at once; every event goes to each destination.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::error::Result;
use crate::events::ThreatEvent;

/// Syslog priority for user-level informational messages.
const SYSLOG_PRIORITY: u8 = 14;

struct SyslogTarget {
    socket: UdpSocket,
    peer: SocketAddr,
}

/// Writes events to a file and/or a syslog collector.
pub struct EventSink {
    file: Option<(PathBuf, File)>,
    syslog: Option<SyslogTarget>,
}

impl EventSink {
    /// Opens the requested destinations. The file is created if missing and
    /// appended to otherwise.
    ///
    /// # Errors
    ///
    /// `ConfigError::Validation` when neither destination is given; I/O
    /// errors when the file cannot be opened or the server cannot be
    /// resolved.
    pub async fn open(file: Option<&Path>, syslog: Option<(&str, u16)>) -> Result<Self> {
        if file.is_none() && syslog.is_none() {
            return Err(ConfigError::Validation {
                field: "output".to_string(),
                reason: "at least a file or a syslog server is required".to_string(),
            }
            .into());
        }

        let file = match file {
            Some(path) => {
                info!(path = %path.display(), "writing threat events to file");
                let handle = OpenOptions::new().create(true).append(true).open(path).await?;
                Some((path.to_path_buf(), handle))
            }
            None => None,
        };

        let syslog = match syslog {
            Some((server, port)) => Some(connect_syslog(server, port).await?),
            None => None,
        };

        Ok(EventSink { file, syslog })
    }

    /// Writes one event to every destination.
    pub async fn write(&mut self, event: &ThreatEvent) -> Result<()> {
        let line = serde_json::to_string(&event.attributes)?;

        if let Some((path, file)) = &mut self.file {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            debug!(event = %event.id, path = %path.display(), "event written to file");
        }
        if let Some(target) = &self.syslog {
            let datagram = format!("<{SYSLOG_PRIORITY}>{line}");
            target.socket.send(datagram.as_bytes()).await?;
            debug!(event = %event.id, peer = %target.peer, "event sent to syslog");
        }
        Ok(())
    }

    /// Writes every event, then flushes the file.
    pub async fn write_all(&mut self, events: &[ThreatEvent]) -> Result<usize> {
        for event in events {
            self.write(event).await?;
        }
        if let Some((_, file)) = &mut self.file {
            file.flush().await?;
        }
        Ok(events.len())
    }
}

async fn connect_syslog(server: &str, port: u16) -> Result<SyslogTarget> {
    let peer = tokio::net::lookup_host((server, port))
        .await?
        .next()
        .ok_or_else(|| ConfigError::Validation {
            field: "server".to_string(),
            reason: format!("{server}:{port} did not resolve to any address"),
        })?;

    let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    info!(%peer, "sending threat events to syslog");
    Ok(SyslogTarget { socket, peer })
}
