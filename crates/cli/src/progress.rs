//! Terminal progress bar for evaluation runs

use async_trait::async_trait;
use ewb_cache::CacheKey;
use ewb_core::{RunReporter, TaskResult};
use ewb_task_graph::Task;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {wide_msg}";

/// Run reporter drawing an `indicatif` progress bar on stderr
#[derive(Debug)]
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Progress bar drawn on stderr when it is a terminal
    #[must_use]
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    /// Reporter that tracks progress without drawing
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Tasks finished so far
    #[must_use]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Total tasks in the run, once known
    #[must_use]
    pub fn length(&self) -> Option<u64> {
        self.bar.length()
    }

    /// Remove the bar from the terminal
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunReporter for ProgressReporter {
    async fn run_started(&self, total: usize, pending: usize) {
        self.bar.set_length(u64::try_from(total).unwrap_or(u64::MAX));
        self.bar
            .set_message(format!("{} cached, {pending} to compute", total - pending));
    }

    async fn task_started(&self, task: &Task) {
        self.bar.set_message(task.request().label());
    }

    async fn task_finished(&self, key: &CacheKey, result: &TaskResult, _elapsed: Duration) {
        self.bar.inc(1);
        if let Some(failure) = result.failure() {
            self.bar
                .println(format!("failed {} {}: {}", key.short(), failure.kind, failure.message));
        }
    }
}
