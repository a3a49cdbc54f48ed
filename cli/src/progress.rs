use std::io::{self, Write};

use dfu::Progress;

/// Console progress bar, one line per operation, redrawn in place.
pub struct ConsoleProgress {
    finished_op: Option<String>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        ConsoleProgress { finished_op: None }
    }
}

impl Progress for ConsoleProgress {
    fn report(&mut self, operation: &str, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        let done = done.min(total);
        let percentage = 100 * done / total;
        let filled = (60 * done / total) as usize;
        print!(
            "\r{:9}{:3}% [{}{}]",
            operation,
            percentage,
            "#".repeat(filled),
            " ".repeat(60 - filled)
        );
        let _ = io::stdout().flush();

        if done >= total {
            if self.finished_op.as_deref() != Some(operation) {
                println!();
                self.finished_op = Some(operation.to_string());
            }
        } else {
            self.finished_op = None;
        }
    }
}
