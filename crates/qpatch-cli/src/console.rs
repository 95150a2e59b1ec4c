//! Interactive console output.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use qpatch_core::{Stage, StageEvent, StageObserver};

/// Line printed for a stage event.
pub fn render(event: &StageEvent) -> String {
    match event {
        StageEvent::Started(stage) => format!(
            "[{:>2}/{}] {}...",
            stage.ordinal(),
            Stage::ALL.len(),
            capitalize(stage.description())
        ),
        StageEvent::Completed(_) => "        done".to_string(),
        StageEvent::Failed(stage, cause) => format!("Failed to {stage}: {cause}"),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Observer that prints every stage event to stdout.
pub fn stdout_observer() -> StageObserver {
    Arc::new(|event: &StageEvent| {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", render(event));
        let _ = stdout.flush();
    })
}

/// Wait for Enter so a double-clicked console window stays open.
pub fn pause(message: &str) {
    print!("{message}");
    let _ = io::stdout().flush();
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
}
