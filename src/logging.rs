//! File logger that splits records between the request log and the proxy log.

use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use crate::error::SetupError;

/// Target used for proxy validation and dialing records.
pub const PROXY_TARGET: &str = "proxies";

/// Routes `proxies` records to one file and everything else to another.
pub struct FileLogger {
    level: LevelFilter,
    requests: Mutex<LineWriter<File>>,
    proxies: Mutex<LineWriter<File>>,
}

fn open_append(path: &Path) -> Result<LineWriter<File>, SetupError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(LineWriter::new)
        .map_err(|source| SetupError::Io {
            path: path.to_path_buf(),
            source,
        })
}

impl FileLogger {
    /// Open (or create) both log files for appending.
    pub fn open(
        request_log: &Path,
        proxy_log: &Path,
        level: LevelFilter,
    ) -> Result<Self, SetupError> {
        Ok(Self {
            level,
            requests: Mutex::new(open_append(request_log)?),
            proxies: Mutex::new(open_append(proxy_log)?),
        })
    }

    /// Install as the global logger.
    pub fn install(self) -> Result<(), SetupError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    fn sink(&self, target: &str) -> &Mutex<LineWriter<File>> {
        if target == PROXY_TARGET {
            &self.proxies
        } else {
            &self.requests
        }
    }
}

/// One log line: seconds since the epoch, level, message.
fn format_line(record: &Record<'_>) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03} {:<5} {}",
        now.as_secs(),
        now.subsec_millis(),
        record.level(),
        record.args()
    )
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record);
        let mut sink = self.sink(record.target()).lock();
        // write errors are dropped
        let _ = writeln!(sink, "{line}");
    }

    fn flush(&self) {
        let _ = self.requests.lock().flush();
        let _ = self.proxies.lock().flush();
    }
}
