use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use tabwriter::TabWriter;
use tokio::sync::Mutex;

/// One row of the server's processlist, captured while a failed apply
/// transaction is still open.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub id: u64,
    pub user: String,
    pub host: String,
    pub db: String,
    pub command: String,
    pub time: i64,
    pub state: String,
    pub info: String,
}

/// Appends apply-phase diagnostics to the error log and counts failures.
///
/// The mutex guards the counter and is held across the file write, so
/// concurrent recorders never interleave their log sections.
pub struct ErrorRecorder {
    path: PathBuf,
    count: Mutex<u64>,
}

impl ErrorRecorder {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            count: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one failure record and bump the counter.
    pub async fn record(
        &self,
        message: &str,
        engine_status: Option<&str>,
        processlist: &[ProcessEntry],
    ) -> Result<()> {
        let mut count = self.count.lock().await;

        let mut file = match OpenOptions::new().append(true).open(&self.path) {
            Ok(file) => file,
            Err(_) => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)?,
        };

        let stamp = chrono::Local::now().format("%Y/%m/%d %H:%M:%S");
        writeln!(file, "{stamp} {message}")?;
        if let Some(status) = engine_status {
            writeln!(file, "{stamp} {status}")?;
        }

        // Blank lines between the engine status and the processlist.
        for _ in 0..3 {
            writeln!(file)?;
        }

        let mut tw = TabWriter::new(&mut file);
        writeln!(tw, "id\tuser\thost\tdatabase\tcommand\ttime\tstate\tinfo")?;
        for p in processlist {
            writeln!(
                tw,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                p.id, p.user, p.host, p.db, p.command, p.time, p.state, p.info
            )?;
        }
        tw.flush()?;

        // Blank lines separating failure records.
        for _ in 0..10 {
            writeln!(file)?;
        }

        *count += 1;
        Ok(())
    }

    /// Number of failures recorded so far. Read after all apply tasks drain.
    pub async fn count(&self) -> u64 {
        *self.count.lock().await
    }
}
