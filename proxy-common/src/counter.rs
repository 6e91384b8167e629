//! 进程内字节计数
//!
//! 读计数在隧道→本地方向累加（还原后的字节数），写计数在本地→隧道方向累加（变换前的字节数）。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::task::JoinHandle;

pub const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct ByteCounters {
    read: AtomicU64,
    written: AtomicU64,
}

impl ByteCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr_read(&self, n: usize) {
        self.read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn incr_written(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn total_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn total_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.read.store(0, Ordering::Relaxed);
        self.written.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for ByteCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "download {} upload {}",
            format_bytes(self.total_read()),
            format_bytes(self.total_written())
        )
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// 定期打印流量统计
pub fn spawn_stats_logger(counters: Arc<ByteCounters>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            info!("流量统计: {}", counters);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_reset() {
        let counters = ByteCounters::new();
        counters.incr_read(10);
        counters.incr_read(5);
        counters.incr_written(7);
        assert_eq!(counters.total_read(), 15);
        assert_eq!(counters.total_written(), 7);

        counters.reset();
        assert_eq!(counters.total_read(), 0);
        assert_eq!(counters.total_written(), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
