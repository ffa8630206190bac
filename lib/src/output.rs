//! User-facing terminal reporting: step headers, task lines, transfer
//! progress bars and cleanup indicator dots.

use std::fmt::Display;
use std::io::Write;

use indicatif::{ProgressBar, ProgressStyle};

use crate::glyph::Glyph;

/// Print the program banner.
pub(crate) fn banner(version: &str) {
    println!("imager v{version} (offspot image assembler)");
    println!();
}

/// Print a step header line.
pub(crate) fn step_header(num: usize, total: usize, name: &str) {
    println!("[{num}/{total}] {name}");
}

/// Print a standalone informational line under the current step.
pub(crate) fn task_note(message: impl Display) {
    println!("  {message}");
}

/// One in-progress task line: the description is printed immediately,
/// the outcome appended once known.
pub(crate) struct TaskLine(());

impl TaskLine {
    pub(crate) fn start(description: impl Display) -> Self {
        print!("  {description}… ");
        let _ = std::io::stdout().flush();
        Self(())
    }

    pub(crate) fn succeed(self, extra: impl Display) {
        println!("OK {extra}");
    }

    pub(crate) fn done(self) {
        println!("OK");
    }

    pub(crate) fn fail(self, reason: impl Display) {
        println!("FAILED {reason}");
    }
}

/// Print a cleanup outcome dot without a line break.
pub(crate) fn add_dot(glyph: Glyph) {
    print!("{glyph}");
    let _ = std::io::stdout().flush();
}

/// A byte-progress bar for one transfer or an aggregated batch.
pub(crate) fn transfer_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "  [{elapsed_precise}] {bytes} of {total_bytes} {wide_bar} {bytes_per_sec} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}
