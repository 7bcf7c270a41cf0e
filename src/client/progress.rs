use std::io::{self, Write};
use std::time::{Duration, Instant};

use super::display::FocusedTable;

/// Sentinel progress/total pair that blanks the line instead of drawing.
pub const BLANK: i64 = -1;

/// Formats `prefix: NN%`.
fn format_percent(prefix: &str, progress: i64, total: i64) -> String {
    let pct = if total > 0 {
        (progress as f64 / total as f64 * 100.0) as u64
    } else {
        0
    };
    format!("{prefix}: {pct}%")
}

/// Rewrites one terminal line in place, padding to the widest line it has
/// ever drawn so shrinking output leaves no trailing characters.
pub struct TerminalDraw<W: Write> {
    w: W,
    max_len: usize,
}

impl<W: Write> TerminalDraw<W> {
    pub fn new(w: W) -> Self {
        Self { w, max_len: 0 }
    }

    pub fn draw(&mut self, prefix: &str, progress: i64, total: i64) -> io::Result<()> {
        if progress == BLANK && total == BLANK {
            write!(self.w, "{}", " ".repeat(self.max_len))?;
            return self.w.flush();
        }

        let mut line = format_percent(prefix, progress, total);
        if line.len() < self.max_len {
            line.push_str(&" ".repeat(self.max_len - line.len()));
        }
        self.max_len = line.len();

        write!(self.w, "{line}\r")?;
        self.w.flush()
    }
}

/// Observes a streamed download and periodically redraws a percent line.
/// Draws happen at most once per interval, and only while this table is
/// the focused one on the display.
pub struct Progress<W: Write> {
    prefix: String,
    fq_table: String,
    total: i64,
    progress: i64,
    interval: Duration,
    last_draw: Option<Instant>,
    draw: TerminalDraw<W>,
    focused: FocusedTable,
}

impl<W: Write> Progress<W> {
    pub fn new(fq_table: &str, total: i64, focused: FocusedTable, w: W) -> Self {
        Self {
            prefix: format!("Downloading: {fq_table}"),
            fq_table: fq_table.to_string(),
            total,
            progress: 0,
            interval: Duration::from_secs(1),
            last_draw: None,
            draw: TerminalDraw::new(w),
            focused,
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Account for a chunk of downloaded bytes, drawing if due.
    pub fn observe(&mut self, n: usize) -> io::Result<()> {
        self.progress += n as i64;

        let due = match self.last_draw {
            None => true,
            Some(last) => last.elapsed() >= self.interval,
        };
        if !due {
            return Ok(());
        }

        if self.focused.is(&self.fq_table) {
            self.draw.draw(&self.prefix, self.progress, self.total)?;
        }
        self.last_draw = Some(Instant::now());

        Ok(())
    }

    /// Draw the final state, then blank the line.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.last_draw.is_none() {
            return Ok(());
        }

        if self.focused.is(&self.fq_table) {
            self.draw.draw(&self.prefix, self.progress, self.total)?;
            self.draw.draw(&self.prefix, BLANK, BLANK)?;
        }
        self.last_draw = None;

        Ok(())
    }
}
