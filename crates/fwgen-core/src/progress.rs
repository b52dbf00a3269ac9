//! Transfer progress tracking.
//!
//! Rate and ETA estimation for bulk transfers, with a DISM-style text bar.

use std::time::{Duration, Instant};

const BAR_WIDTH: usize = 55;
const BAR_LABEL_AT: usize = 28;
const MIB: f64 = 1024.0 * 1024.0;

/// Progress of one bulk transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    total: u64,
    transferred: u64,
    started: Instant,
}

impl TransferProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            transferred: 0,
            started: Instant::now(),
        }
    }

    /// Record `bytes` more transferred. The count never decreases.
    pub fn advance(&mut self, bytes: u64) {
        self.transferred = self.transferred.saturating_add(bytes).min(self.total);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.transferred * 100) / self.total) as u8
        }
    }

    /// Throughput in MiB/s over `elapsed`.
    pub fn rate_mib_s(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.transferred as f64 / MIB / secs
    }

    /// Remaining time, extrapolated from the average rate so far.
    pub fn eta(&self, elapsed: Duration) -> Option<Duration> {
        if self.transferred == 0 {
            return None;
        }
        let remaining = self.total - self.transferred;
        let secs = elapsed.as_secs_f64() * remaining as f64 / self.transferred as f64;
        Some(Duration::from_secs_f64(secs))
    }

    /// One status line: bar, rate, ETA.
    pub fn render(&self) -> String {
        self.render_at(self.elapsed())
    }

    pub fn render_at(&self, elapsed: Duration) -> String {
        let eta = self
            .eta(elapsed)
            .map(format_eta)
            .unwrap_or_else(|| "--:--:--.-".to_string());
        format!(
            "{} {:.0}MB/s {}",
            render_bar(self.percent()),
            self.rate_mib_s(elapsed),
            eta
        )
    }
}

/// `[=====...   42%   ...]`, 55 columns between the brackets.
pub fn render_bar(percent: u8) -> String {
    let percent = percent.min(100) as usize;
    let filled = percent * BAR_WIDTH / 100;

    let mut bar = "=".repeat(filled);
    bar.push_str(&" ".repeat(BAR_WIDTH - filled));
    bar.insert_str(BAR_LABEL_AT, &format!("{}%", percent));

    if percent == 100 {
        bar.remove(0);
    } else if percent < 10 {
        bar.insert(BAR_LABEL_AT, ' ');
    }

    format!("[{}]", bar)
}

fn format_eta(eta: Duration) -> String {
    let total = eta.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{}",
        total / 3600,
        (total / 60) % 60,
        total % 60,
        eta.subsec_millis() / 100
    )
}
