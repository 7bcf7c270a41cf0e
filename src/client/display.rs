use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;

/// Table status reported to the display serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Starting,
    Downloading,
    Applying,
    Restored,
    Error,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Status::Starting => "Starting",
            Status::Downloading => "Downloading",
            Status::Applying => "Applying",
            Status::Restored => "Restored",
            Status::Error => "ERROR",
        }
    }

    /// Restored and ERROR end a table's status line.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Restored | Status::Error)
    }
}

/// Status event for one table, schema-qualified.
#[derive(Debug, Clone)]
pub struct DisplayEvent {
    pub fq_table: String,
    pub status: Status,
}

impl DisplayEvent {
    pub fn new(schema: &str, table: &str, status: Status) -> Self {
        Self {
            fq_table: format!("{schema}.{table}"),
            status,
        }
    }

    fn line(&self) -> String {
        format!("{}: {}", self.status.label(), self.fq_table)
    }
}

/// Name of the table whose download progress may draw on the terminal.
/// Empty when no table holds the line.
#[derive(Clone, Default)]
pub struct FocusedTable(Arc<Mutex<String>>);

impl FocusedTable {
    pub fn get(&self) -> String {
        self.0.lock().unwrap().clone()
    }

    pub fn set(&self, name: &str) {
        *self.0.lock().unwrap() = name.to_string();
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn is(&self, name: &str) -> bool {
        *self.0.lock().unwrap() == name
    }
}

/// Single consumer of status events from all workers. Owns the terminal:
/// the current table's line is rewritten in place, events for other tables
/// queue until the current table reaches a terminal status.
pub struct Display<W: Write> {
    w: W,
    focused: FocusedTable,
    current: Option<DisplayEvent>,
    queue: Vec<DisplayEvent>,
    last_len: usize,
}

impl<W: Write> Display<W> {
    pub fn new(w: W, focused: FocusedTable) -> Self {
        Self {
            w,
            focused,
            current: None,
            queue: Vec::new(),
            last_len: 0,
        }
    }

    pub fn handle(&mut self, event: DisplayEvent) -> io::Result<()> {
        // The first event seen becomes the current table.
        let current = self.current.get_or_insert_with(|| event.clone()).clone();

        if self.focused.get().is_empty() && current.status == Status::Downloading {
            self.focused.set(&current.fq_table);
        }

        if current.fq_table == event.fq_table {
            // Blank the previous status, then rewrite in place.
            write!(self.w, "{}\r", " ".repeat(self.last_len))?;
            let line = event.line();
            self.last_len = line.len();
            write!(self.w, "{line}\r")?;

            if event.status.is_terminal() {
                writeln!(self.w)?;
                self.advance(&current)?;
            }
        } else {
            // Queue the event; only the latest status per table matters.
            match self
                .queue
                .iter_mut()
                .find(|q| q.fq_table == event.fq_table)
            {
                Some(slot) => *slot = event,
                None => self.queue.push(event),
            }
        }

        self.w.flush()
    }

    /// The current table just finished: flush queued terminal statuses and
    /// promote the oldest remaining in-flight table, if any.
    fn advance(&mut self, finished: &DisplayEvent) -> io::Result<()> {
        let mut rest = Vec::new();
        for queued in self.queue.drain(..) {
            if queued.status.is_terminal() {
                writeln!(self.w, "{}", queued.line())?;
            } else if queued.fq_table != finished.fq_table {
                rest.push(queued);
            }
        }
        self.queue = rest;

        match self.queue.first().cloned() {
            Some(next) => {
                if next.status == Status::Downloading {
                    self.focused.set(&next.fq_table);
                }
                let line = next.line();
                self.last_len = line.len();
                write!(self.w, "{line}\r")?;
                self.current = Some(next);
            }
            None => {
                self.current = None;
                self.focused.clear();
            }
        }

        Ok(())
    }
}

/// Consume events until every sender is gone.
pub async fn run(mut rx: UnboundedReceiver<DisplayEvent>, focused: FocusedTable) {
    let mut display = Display::new(std::io::stdout(), focused);

    while let Some(event) = rx.recv().await {
        if display.handle(event).is_err() {
            break;
        }
    }
}
