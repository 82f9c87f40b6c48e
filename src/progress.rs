use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})";

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

/// Receives progress from the download, aggregation and bulk paths.
/// `advance` is called concurrently from worker threads and must be atomic.
pub trait ProgressSink: Send + Sync {
    fn start(&self, _message: &str, _total: u64) {}
    fn advance(&self, delta: u64);
    fn event(&self, _event: ProgressEvent) {}
    fn finish(&self) {}
}

pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn advance(&self, _delta: u64) {}

    fn event(&self, event: ProgressEvent) {
        tracing::debug!(elapsed = ?event.elapsed, "{}", event.message);
    }
}

pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        Self { bar }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for BarProgress {
    fn start(&self, message: &str, total: u64) {
        self.bar.reset();
        self.bar.set_length(total);
        self.bar.set_message(message.to_string());
    }

    fn advance(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn event(&self, event: ProgressEvent) {
        tracing::debug!(elapsed = ?event.elapsed, "{}", event.message);
    }

    fn finish(&self) {
        self.bar.finish();
    }
}

pub fn sink_for(interactive: bool) -> Box<dyn ProgressSink> {
    if interactive {
        Box::new(BarProgress::new())
    } else {
        Box::new(SilentProgress)
    }
}
