//! Structured logging with `tracing`.
//!
//! Two entry points:
//! - [`init_subscriber`] — compact stderr output, used by the relay.
//! - [`init_daemon_subscriber`] — file-only output under
//!   `<state-dir>/logs/`, rotated daily, used by the daemon so the
//!   terminal stays clean while an assistant session is live.
//!
//! Log payloads never include ciphertext bodies or decrypted user content.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

/// Initialize the global tracing subscriber with stderr output only.
///
/// Call once at application startup. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // set_global_default is a no-op if already set
    let _ = subscriber.try_init();
}

/// Initialize the global tracing subscriber writing to daily log files.
///
/// Files land in `<dir>/YYYY-MM-DD-HH-MM-SS.log`, one per calendar day
/// (named after the moment the first line of that day is written).
pub fn init_daemon_subscriber(level: &str, logs_dir: PathBuf) -> io::Result<()> {
    use tracing_subscriber::EnvFilter;

    fs::create_dir_all(&logs_dir)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = DailyLogWriter::new(logs_dir);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
        .compact();

    let _ = subscriber.try_init();
    Ok(())
}

struct DayFile {
    day: NaiveDate,
    file: File,
}

/// `MakeWriter` that opens a fresh timestamped file when the UTC date
/// changes.
#[derive(Clone)]
pub struct DailyLogWriter {
    dir: PathBuf,
    current: Arc<Mutex<Option<DayFile>>>,
}

impl DailyLogWriter {
    /// Create a writer rooted at `dir` (must exist).
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Path of the log file that a write at `now` would open.
    fn file_name_for_now() -> String {
        Utc::now().format("%Y-%m-%d-%H-%M-%S.log").to_string()
    }

    fn write_locked(&self, buf: &[u8]) -> io::Result<usize> {
        let today = Utc::now().date_naive();
        let mut guard = self.current.lock();

        let needs_rotate = match guard.as_ref() {
            Some(df) => df.day != today,
            None => true,
        };
        if needs_rotate {
            let path = self.dir.join(Self::file_name_for_now());
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            *guard = Some(DayFile { day: today, file });
        }

        // Rotation above guarantees the entry exists.
        let df = guard.as_mut().expect("log file open");
        df.file.write(buf)
    }
}

/// Handle produced per log event; delegates to the shared rotating file.
pub struct DailyLogHandle {
    writer: DailyLogWriter,
}

impl Write for DailyLogHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write_locked(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(df) = self.writer.current.lock().as_mut() {
            df.file.flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DailyLogWriter {
    type Writer = DailyLogHandle;

    fn make_writer(&'a self) -> Self::Writer {
        DailyLogHandle {
            writer: self.clone(),
        }
    }
}
