//! Transfer progress tracking.
//!
//! One tracker per job. Arbitrarily many writers bump the byte counter;
//! a single display path renders at most one line per 500ms and a final
//! summary exactly once. When the payload itself goes to stdout the tracker
//! routes its output to stderr so progress bytes never interleave with the
//! payload.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::fmt::{format_duration, format_rate, format_size};

const REPORT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSink {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct DisplayState {
    start: Option<std::time::Instant>,
    last_report: Option<std::time::Instant>,
    last_bytes: u64,
}

#[derive(Debug)]
pub struct Progress {
    /// declared total, 0 = unknown
    total: u64,
    transferred: AtomicU64,
    finished: AtomicBool,
    sink: ProgressSink,
    state: Mutex<DisplayState>,
}

impl Progress {
    pub fn new(total: u64, sink: ProgressSink) -> Arc<Self> {
        Arc::new(Self {
            total,
            transferred: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            sink,
            state: Mutex::new(DisplayState {
                start: None,
                last_report: None,
                last_bytes: 0,
            }),
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Record `n` transferred bytes; renders a progress line when at least
    /// 500ms elapsed since the previous one.
    pub fn add(&self, n: u64) {
        let transferred = self.transferred.fetch_add(n, Ordering::Relaxed) + n;
        let now = std::time::Instant::now();
        let mut state = self.state.lock().unwrap();
        if state.start.is_none() {
            state.start = Some(now);
        }
        let due = match state.last_report {
            Some(last) => now.duration_since(last) >= REPORT_INTERVAL,
            None => true,
        };
        if !due || self.finished.load(Ordering::Relaxed) {
            return;
        }
        let rate = match state.last_report {
            Some(last) => {
                let dt = now.duration_since(last).as_secs_f64();
                (transferred - state.last_bytes) as f64 / dt
            }
            None => 0.0,
        };
        let elapsed = now.duration_since(state.start.unwrap_or(now));
        let line = render_line(transferred, self.total, rate, elapsed);
        state.last_report = Some(now);
        state.last_bytes = transferred;
        drop(state);
        self.emit(&format!("\r{line}"));
    }

    /// Emit the final summary. Idempotent: only the first call reports.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let transferred = self.transferred();
        let state = self.state.lock().unwrap();
        let elapsed = state
            .start
            .map(|start| start.elapsed())
            .unwrap_or_default();
        drop(state);
        let average = if elapsed.as_secs_f64() > 0.0 {
            transferred as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        self.emit(&format!(
            "\nTransfer completed\nTotal: {}\nAverage: {}\nDuration: {}\n",
            format_size(transferred),
            format_rate(average),
            format_duration(elapsed),
        ));
    }

    fn emit(&self, text: &str) {
        match self.sink {
            ProgressSink::Stdout => {
                let mut out = std::io::stdout();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            ProgressSink::Stderr => {
                let mut err = std::io::stderr();
                let _ = err.write_all(text.as_bytes());
                let _ = err.flush();
            }
        }
    }
}

/// Single-line display. With a known total:
/// `Progress: X / Y (P.P%) - R/s - Duration: D`; without one the fraction
/// and percentage are dropped.
fn render_line(transferred: u64, total: u64, rate: f64, elapsed: std::time::Duration) -> String {
    if total > 0 {
        let percent = transferred as f64 / total as f64 * 100.0;
        format!(
            "Progress: {} / {} ({:.1}%) - {} - Duration: {}",
            format_size(transferred),
            format_size(total),
            percent,
            format_rate(rate),
            format_duration(elapsed),
        )
    } else {
        format!(
            "Progress: {} - {} - Duration: {}",
            format_size(transferred),
            format_rate(rate),
            format_duration(elapsed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotone_across_threads() {
        let progress = Progress::new(0, ProgressSink::Stderr);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let progress = progress.clone();
                scope.spawn(move || {
                    for _ in 0..1000 {
                        progress.add(3);
                    }
                });
            }
        });
        assert_eq!(progress.transferred(), 24_000);
    }

    #[test]
    fn finish_is_idempotent() {
        let progress = Progress::new(10, ProgressSink::Stderr);
        progress.add(10);
        progress.finish();
        progress.finish();
        assert!(progress.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn line_with_known_total() {
        let line = render_line(
            50 * 1024 * 1024,
            100 * 1024 * 1024,
            10.0 * 1024.0 * 1024.0,
            std::time::Duration::from_secs(5),
        );
        assert_eq!(
            line,
            "Progress: 50.0M / 100.0M (50.0%) - 10.0M/s - Duration: 5s"
        );
    }

    #[test]
    fn line_with_unknown_total() {
        let line = render_line(2048, 0, 1024.0, std::time::Duration::from_secs(2));
        assert_eq!(line, "Progress: 2.0K - 1.0K/s - Duration: 2s");
    }
}
