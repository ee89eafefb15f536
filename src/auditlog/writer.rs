//! Audit log writers.

use super::record::AuditLog;
use super::AuditLogError;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::{ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Network timeout for the `syslog` and `https` writers.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a writer sends records.
#[derive(Debug, Clone, Default)]
pub struct WriterConfig {
    /// `SecAuditLog`: file, `host:port` or URL depending on the writer.
    pub target: Option<String>,
    /// `SecAuditLogStorageDir` for the `concurrent` writer.
    pub storage_dir: Option<PathBuf>,
    /// MIME type of the formatted records.
    pub mime: &'static str,
}

/// Ships formatted records.
pub trait Writer: Send + Sync {
    /// Write one formatted record.
    fn write(&self, log: &AuditLog, data: &[u8]) -> Result<(), AuditLogError>;

    /// Flush and release resources.
    fn close(&self) -> Result<(), AuditLogError> {
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, AuditLogError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn required_target<'a>(cfg: &'a WriterConfig, writer: &str) -> Result<&'a str, AuditLogError> {
    cfg.target
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AuditLogError::Config(format!("{} audit writer needs SecAuditLog", writer)))
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopWriter;

impl Writer for NoopWriter {
    fn write(&self, _log: &AuditLog, _data: &[u8]) -> Result<(), AuditLogError> {
        Ok(())
    }
}

/// Appends every record to one file.
#[derive(Debug)]
pub struct SerialWriter {
    file: Mutex<File>,
}

impl SerialWriter {
    /// Open (or create) the log file named by the target.
    pub fn new(cfg: &WriterConfig) -> Result<Self, AuditLogError> {
        let path = required_target(cfg, "serial")?;
        Ok(Self {
            file: Mutex::new(open_append(Path::new(path))?),
        })
    }
}

impl Writer for SerialWriter {
    fn write(&self, _log: &AuditLog, data: &[u8]) -> Result<(), AuditLogError> {
        let mut file = self.file.lock();
        file.write_all(data)?;
        if !data.ends_with(b"\n") {
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<(), AuditLogError> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// One file per transaction under `<dir>/<date>/<date-HHMM>/`, plus an
/// index line per record in the target file.
#[derive(Debug)]
pub struct ConcurrentWriter {
    dir: PathBuf,
    index: Mutex<Option<File>>,
}

impl ConcurrentWriter {
    /// Create a writer storing records under the storage directory
    /// (or the target when no storage directory is set).
    pub fn new(cfg: &WriterConfig) -> Result<Self, AuditLogError> {
        let dir = match (&cfg.storage_dir, &cfg.target) {
            (Some(dir), _) => dir.clone(),
            (None, Some(target)) => PathBuf::from(target),
            (None, None) => {
                return Err(AuditLogError::Config(
                    "concurrent audit writer needs SecAuditLogStorageDir".to_string(),
                ))
            }
        };
        fs::create_dir_all(&dir)?;
        let index = match (&cfg.storage_dir, &cfg.target) {
            (Some(_), Some(target)) => Some(open_append(Path::new(target))?),
            _ => None,
        };
        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    /// Path of the record file for a transaction, relative to the storage
    /// directory.
    pub fn relative_path(now: &chrono::DateTime<Local>, tx_id: &str) -> PathBuf {
        let date = now.format("%Y%m%d").to_string();
        PathBuf::from(&date)
            .join(format!("{}-{}", date, now.format("%H%M")))
            .join(format!("{}-{}", now.format("%Y%m%d-%H%M%S"), tx_id))
    }

    fn index_line(log: &AuditLog, relative: &Path, size: usize) -> String {
        let tx = &log.transaction;
        let (request_line, status) = (
            tx.request
                .as_ref()
                .map(|r| format!("{} {} {}", r.method, r.uri, r.protocol))
                .unwrap_or_default(),
            tx.response.as_ref().map_or(0, |r| r.status),
        );
        format!(
            "{} {} - - [{}] \"{}\" {} {} \"{}\" {} 0 {}\n",
            if tx.server_id.is_empty() { "-" } else { &tx.server_id },
            tx.client_ip,
            tx.timestamp,
            request_line,
            status,
            size,
            tx.id,
            relative.display(),
            size
        )
    }
}

impl Writer for ConcurrentWriter {
    fn write(&self, log: &AuditLog, data: &[u8]) -> Result<(), AuditLogError> {
        let relative = Self::relative_path(&Local::now(), &log.transaction.id);
        let path = self.dir.join(&relative);

        let mut file = {
            let mut index = self.index.lock();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            if let Some(index) = index.as_mut() {
                index.write_all(Self::index_line(log, &relative, data.len()).as_bytes())?;
            }
            file
        };

        file.write_all(data)?;
        Ok(())
    }

    fn close(&self) -> Result<(), AuditLogError> {
        if let Some(index) = self.index.lock().as_mut() {
            index.flush()?;
        }
        Ok(())
    }
}

/// Sends each record as an RFC 5424 message over UDP.
#[derive(Debug)]
pub struct SyslogWriter {
    socket: UdpSocket,
}

impl SyslogWriter {
    /// `local0.info`.
    pub const PRIORITY: u8 = 134;

    /// Connect to the `host:port` target.
    pub fn new(cfg: &WriterConfig) -> Result<Self, AuditLogError> {
        let target = required_target(cfg, "syslog")?;
        let addr = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| AuditLogError::Config(format!("syslog target {} did not resolve", target)))?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)?;
        socket.set_write_timeout(Some(NETWORK_TIMEOUT))?;
        socket.connect(addr)?;
        Ok(Self { socket })
    }
}

impl Writer for SyslogWriter {
    fn write(&self, _log: &AuditLog, data: &[u8]) -> Result<(), AuditLogError> {
        let body = String::from_utf8_lossy(data);
        let message = format!(
            "<{}>1 {} - {} - - - {}",
            Self::PRIORITY,
            Local::now().to_rfc3339(),
            env!("CARGO_PKG_NAME"),
            body.trim_end()
        );
        self.socket.send(message.as_bytes())?;
        Ok(())
    }
}

/// POSTs each record to an HTTP(S) endpoint.
#[derive(Debug)]
pub struct HttpsWriter {
    client: reqwest::blocking::Client,
    url: String,
    mime: &'static str,
}

impl HttpsWriter {
    /// Build a client for the target URL.
    pub fn new(cfg: &WriterConfig) -> Result<Self, AuditLogError> {
        let url = required_target(cfg, "https")?;
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(AuditLogError::Config(format!("https audit writer needs a URL, got {}", url)));
        }
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(NETWORK_TIMEOUT)
            .timeout(NETWORK_TIMEOUT * 5)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            mime: cfg.mime,
        })
    }
}

impl Writer for HttpsWriter {
    fn write(&self, _log: &AuditLog, data: &[u8]) -> Result<(), AuditLogError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, self.mime)
            .body(data.to_vec())
            .send()?;
        if !response.status().is_success() {
            return Err(AuditLogError::Config(format!(
                "audit endpoint answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auditlog::record::AuditTransaction;
    use crate::auditlog::AuditLogParts;
    use chrono::TimeZone;

    fn log(id: &str) -> AuditLog {
        AuditLog {
            parts: AuditLogParts::default(),
            transaction: AuditTransaction {
                id: id.to_string(),
                client_ip: "10.0.0.1".to_string(),
                ..Default::default()
            },
            messages: Vec::new(),
        }
    }

    #[test]
    fn test_serial_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/audit.log");
        let writer = SerialWriter::new(&WriterConfig {
            target: Some(path.display().to_string()),
            ..Default::default()
        })
        .unwrap();
        writer.write(&log("a"), b"{\"a\":1}").unwrap();
        writer.write(&log("b"), b"{\"b\":2}\n").unwrap();
        writer.close().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":1}\n{\"b\":2}\n");
    }

    #[test]
    fn test_serial_needs_target() {
        assert!(SerialWriter::new(&WriterConfig::default()).is_err());
    }

    #[test]
    fn test_concurrent_layout() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(
            ConcurrentWriter::relative_path(&now, "tx1"),
            PathBuf::from("20240307/20240307-0905/20240307-090501-tx1")
        );
    }

    #[test]
    fn test_concurrent_writes_record_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("index.log");
        let writer = ConcurrentWriter::new(&WriterConfig {
            target: Some(index.display().to_string()),
            storage_dir: Some(dir.path().join("records")),
            ..Default::default()
        })
        .unwrap();
        writer.write(&log("tx42"), b"payload").unwrap();
        writer.close().unwrap();

        let line = fs::read_to_string(&index).unwrap();
        assert!(line.contains("\"tx42\""));
        let relative = line.split_whitespace().rev().nth(2).unwrap();
        let record = dir.path().join("records").join(relative);
        assert_eq!(fs::read(record).unwrap(), b"payload");
    }

    #[test]
    fn test_syslog_sends_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let writer = SyslogWriter::new(&WriterConfig {
            target: Some(server.local_addr().unwrap().to_string()),
            ..Default::default()
        })
        .unwrap();
        writer.write(&log("x"), b"{\"id\":\"x\"}\n").unwrap();

        let mut buf = [0u8; 1024];
        let n = server.recv(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("<134>1 "));
        assert!(text.ends_with("{\"id\":\"x\"}"));
    }

    #[test]
    fn test_https_rejects_non_url() {
        let err = HttpsWriter::new(&WriterConfig {
            target: Some("/var/log/audit.log".to_string()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, AuditLogError::Config(_)));
    }
}
