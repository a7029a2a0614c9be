//! Shared progress and logging helpers to keep progress bars pinned.

use crate::resync::{SyncObserver, SyncProgressReport};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

static MULTI_PROGRESS: OnceLock<MultiProgress> = OnceLock::new();

fn multi_progress() -> &'static MultiProgress {
    MULTI_PROGRESS.get_or_init(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        mp
    })
}

pub fn add_progress_bar(len: u64) -> ProgressBar {
    multi_progress().add(ProgressBar::new(len))
}

pub fn add_spinner(message: &str) -> ProgressBar {
    let pb = multi_progress().add(ProgressBar::new_spinner());
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {pos} rows {msg}",
    ) {
        pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Renders one spinner per table during a resync
#[derive(Default)]
pub struct ProgressObserver {
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncObserver for ProgressObserver {
    fn on_start(&self, report: &SyncProgressReport) {
        let pb = add_spinner(&format!("{} -> {}", report.table, report.index));
        self.bars.lock().insert(report.table.clone(), pb);
    }

    fn on_batch(&self, report: &SyncProgressReport) {
        if let Some(pb) = self.bars.lock().get(&report.table) {
            pb.set_position(report.fetched);
            pb.set_message(format!(
                "{} -> {} ({} indexed)",
                report.table, report.index, report.indexed
            ));
        }
    }

    fn on_complete(&self, report: &SyncProgressReport) {
        if let Some(pb) = self.bars.lock().remove(&report.table) {
            pb.set_position(report.fetched);
            pb.finish_with_message(format!("✓ {} ({} indexed)", report.table, report.indexed));
        }
    }

    fn on_error(&self, report: &SyncProgressReport) {
        if let Some(pb) = self.bars.lock().remove(&report.table) {
            pb.abandon_with_message(format!(
                "✗ {}: {}",
                report.table,
                report.error.as_deref().unwrap_or("failed")
            ));
        }
    }
}

#[derive(Default, Clone)]
pub struct LogWriterFactory;

pub struct LogWriter {
    buffer: String,
}

impl LogWriter {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let line = self.buffer.trim_end_matches('\n').trim_end_matches('\r');
        if line.is_empty() {
            let _ = multi_progress().println(String::new());
        } else {
            let _ = multi_progress().println(line.to_string());
        }
        self.buffer.clear();
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let chunk = String::from_utf8_lossy(buf);
        self.buffer.push_str(&chunk);

        while let Some(idx) = self.buffer.find('\n') {
            let line = self.buffer[..idx].trim_end_matches('\r');
            if line.is_empty() {
                let _ = multi_progress().println(String::new());
            } else {
                let _ = multi_progress().println(line.to_string());
            }
            self.buffer.drain(..idx + 1);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer();
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter::new()
    }
}
