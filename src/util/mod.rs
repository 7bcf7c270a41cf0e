pub mod filename;
pub mod sql;

use std::time::{Duration, Instant};

/// Window in which a second interrupt must arrive to terminate the run.
const SIGNAL_TIMEOUT_SECS: u64 = 3;

/// Trap SIGINT so a stray ctrl+c cannot kill a half-applied restore.
/// The first interrupt warns; a second within the timeout window exits.
pub fn catch_interrupts() {
    tokio::spawn(async {
        let mut last: Option<Instant> = None;

        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }

            if let Some(prev) = last {
                if prev.elapsed() < Duration::from_secs(SIGNAL_TIMEOUT_SECS) {
                    eprintln!();
                    std::process::exit(0);
                }
            }

            eprintln!();
            eprintln!("interrupt signal caught!");
            eprintln!("Send the signal again within {SIGNAL_TIMEOUT_SECS} seconds to exit");
            eprintln!();

            last = Some(Instant::now());
        }
    });
}
