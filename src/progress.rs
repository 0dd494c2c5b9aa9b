//! Progress indicators and confirmation prompts for stackplan.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use stackgraph::{ConfirmCallback, NodeKey, NodeResult, ProgressCallback};
use std::time::Duration;

use crate::ui;

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// A spinner for short, unmeasured work
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = if console::Term::stderr().is_term() {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn finish_error(pb: &ProgressBar, msg: &str) {
    pb.finish_and_clear();
    eprintln!("{} {}", "✗".red(), msg);
}

/// Batch progress for apply and destroy
///
/// One bar per batch; node lines are printed above it.
pub struct BatchProgress {
    bar: Option<ProgressBar>,
    verbose: bool,
    quiet: bool,
    interactive: bool,
}

impl BatchProgress {
    pub fn new(verbose: u8, quiet: bool) -> Self {
        Self {
            bar: None,
            verbose: verbose > 0,
            quiet,
            interactive: console::Term::stderr().is_term(),
        }
    }

    fn line(&self, text: String) {
        if self.quiet {
            return;
        }
        match &self.bar {
            Some(pb) => pb.suspend(|| println!("{text}")),
            None => println!("{text}"),
        }
    }
}

impl ProgressCallback for BatchProgress {
    fn on_batch_start(&mut self, index: usize, total: usize, nodes: &[NodeKey]) {
        let header = format!("[{}/{}]", index + 1, total).blue().bold();
        self.line(format!("{header} {}", ui::count(nodes.len(), "node")));

        if self.interactive && !self.quiet {
            let pb = ProgressBar::new(nodes.len() as u64);
            pb.set_style(bar_style());
            pb.set_message(format!("batch {}", index + 1));
            self.bar = Some(pb);
        }
    }

    fn on_node_complete(&mut self, key: &NodeKey, result: &NodeResult) {
        match result {
            NodeResult::Applied if self.verbose => {
                self.line(format!("  {} {}", "✓".green(), key));
            }
            NodeResult::Destroyed if self.verbose => {
                self.line(format!("  {} {} destroyed", "✓".green(), key));
            }
            NodeResult::Failed { error } => {
                self.line(format!("  {} {} ({})", "✗".red(), key, error));
            }
            NodeResult::Skipped { reason } => {
                self.line(format!("  {} {} {}", "-".dimmed(), key, reason.dimmed()));
            }
            _ => {}
        }
        if let Some(pb) = &self.bar {
            pb.inc(1);
        }
    }

    fn on_batch_complete(&mut self, _index: usize) {
        if let Some(pb) = self.bar.take() {
            pb.finish_and_clear();
        }
    }

    fn on_stack_persisted(&mut self, stack: &str) {
        self.line(format!("  {} saved state for stack {}", "✓".green(), stack.bold()));
    }
}

/// Asks on the terminal unless `--yes` was given
pub struct PromptConfirm {
    assume_yes: bool,
}

impl PromptConfirm {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, prompt: &str) -> anyhow::Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        if !console::Term::stdout().is_term() {
            anyhow::bail!("not running in a terminal; pass --yes to proceed");
        }

        let confirmed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?;

        Ok(confirmed)
    }
}
