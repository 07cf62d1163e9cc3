//! Orchestrator progress reporting: a phase progress bar plus a scrolling
//! log of retries/skips/failures, driven by the `progress(phase, pct, msg)`
//! callback the orchestrator invokes around each phase (§4.5).

use super::icons::{CHECK, CROSS, HOURGLASS, SPARKLE, WARNING};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

pub struct OrchestratorUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    verbose: bool,
}

impl OrchestratorUI {
    pub fn new(total_phases: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▓▒░");

        let phase_bar = multi.add(ProgressBar::new(total_phases));
        phase_bar.set_style(style);
        phase_bar.set_prefix("Phases");

        Self {
            multi,
            phase_bar,
            verbose,
        }
    }

    pub fn start_phase(&self, phase: &str) {
        self.phase_bar
            .set_message(format!("{} {}", HOURGLASS, style(phase).yellow()));
    }

    /// Invoked for each `progress(phase, pct, msg)` callback from the
    /// orchestrator; `pct` is 0-100.
    pub fn phase_progress(&self, phase: &str, pct: u8, msg: &str) {
        self.phase_bar.set_message(format!(
            "{} {}% {}",
            style(phase).yellow(),
            pct,
            style(msg).dim()
        ));
        if self.verbose {
            self.multi
                .println(format!("    {} {phase} {pct}% {msg}", style("→").dim()))
                .ok();
        }
    }

    pub fn phase_skipped(&self, phase: &str) {
        self.phase_bar.inc(1);
        self.multi
            .println(format!(
                "{} {} skipped (hash match, already succeeded)",
                style("↷").dim(),
                style(phase).dim()
            ))
            .ok();
    }

    pub fn phase_retry(&self, phase: &str, attempt: u32, max_retries: u32) {
        self.multi
            .println(format!(
                "{} {} retry {}/{}",
                WARNING,
                style(phase).yellow(),
                attempt,
                max_retries
            ))
            .ok();
    }

    pub fn phase_success(&self, phase: &str, duration: Duration) {
        self.phase_bar.inc(1);
        self.multi
            .println(format!(
                "{} {} complete in {:.1}s",
                CHECK,
                style(phase).green().bold(),
                duration.as_secs_f64()
            ))
            .ok();
    }

    pub fn phase_failed(&self, phase: &str, reason: &str) {
        self.multi
            .println(format!(
                "{} {} failed: {}",
                CROSS,
                style(phase).red().bold(),
                reason
            ))
            .ok();
    }

    pub fn run_complete(&self, audiobook_path: Option<&str>) {
        self.phase_bar.finish_with_message("done");
        match audiobook_path {
            Some(path) => {
                self.multi
                    .println(format!("{} audiobook ready at {}", SPARKLE, style(path).green()))
                    .ok();
            }
            None => {
                self.multi.println(format!("{SPARKLE} run complete")).ok();
            }
        }
    }

    pub fn run_cancelled(&self) {
        self.phase_bar.finish_with_message("cancelled");
        self.multi
            .println(format!("{} run cancelled", style("■").dim()))
            .ok();
    }
}
