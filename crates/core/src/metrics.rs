//! Metrics collection and reporting for repair sessions.
//!
//! Counters cover the full negotiation loop:
//! - Transmission (segments sent, dropped, received)
//! - Repair (NACKs, descriptors, advertisements, repair segments)
//! - Block lifecycle (enqueued, completed, released, backpressure)
//! - Resources (pool peak usage and overruns)
//!
//! # Thread Safety
//!
//! The `Metrics` struct is NOT thread-safe. For multi-threaded use, keep
//! per-thread metrics and merge them at the end.

use crate::segment::PoolStats;
use std::time::{Duration, Instant};

/// Counters for one simulated transfer.
#[derive(Debug, Clone)]
pub struct Metrics {
    // === Timing ===
    /// When the run started
    pub start_time: Instant,

    /// When the run ended (set on completion)
    pub end_time: Option<Instant>,

    /// Transmit/repair rounds executed
    pub rounds: u64,

    // === Blocks ===
    /// Blocks the transfer set out to deliver
    pub blocks_planned: u64,

    /// Blocks initialized for transmission
    pub blocks_enqueued: u64,

    /// Blocks whose data the receiver fully recovered
    pub blocks_completed: u64,

    /// Blocks returned to the pool after completion
    pub blocks_released: u64,

    /// Enqueue attempts deferred by pool or window exhaustion
    pub enqueue_stalls: u64,

    // === Transmission ===
    /// Segments put on the channel
    pub segments_sent: u64,

    /// Segments lost by the channel
    pub segments_dropped: u64,

    /// Segments delivered to the receiver
    pub segments_received: u64,

    /// Segments the receiver already had
    pub segments_duplicate: u64,

    /// Segments sent because of a repair request
    pub repair_segments_sent: u64,

    // === Repair ===
    /// NACK messages sent by the receiver
    pub nacks_sent: u64,

    /// Total NACK bytes
    pub nack_bytes: u64,

    /// Repair descriptors carried in NACKs
    pub repair_descriptors: u64,

    /// Repair advertisements built by the sender
    pub repair_adverts: u64,

    /// Blocks re-armed by `tx_reset`
    pub tx_resets: u64,

    // === Resources ===
    /// High-water mark of sender segments in use
    pub segment_peak_usage: usize,

    /// Segment pool exhaustion periods
    pub segment_overruns: u64,

    /// Block pool exhaustion periods
    pub block_overruns: u64,
}

impl Metrics {
    /// Create new metrics with start time set to now.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            end_time: None,
            rounds: 0,
            blocks_planned: 0,
            blocks_enqueued: 0,
            blocks_completed: 0,
            blocks_released: 0,
            enqueue_stalls: 0,
            segments_sent: 0,
            segments_dropped: 0,
            segments_received: 0,
            segments_duplicate: 0,
            repair_segments_sent: 0,
            nacks_sent: 0,
            nack_bytes: 0,
            repair_descriptors: 0,
            repair_adverts: 0,
            tx_resets: 0,
            segment_peak_usage: 0,
            segment_overruns: 0,
            block_overruns: 0,
        }
    }

    /// Mark the run as complete.
    pub fn complete(&mut self) {
        self.end_time = Some(Instant::now());
    }

    /// Total duration (or current elapsed if not complete).
    pub fn duration(&self) -> Duration {
        match self.end_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// Fold a segment pool snapshot into the resource counters.
    pub fn record_segment_pool(&mut self, stats: &PoolStats) {
        self.segment_peak_usage = self.segment_peak_usage.max(stats.peak_usage);
        self.segment_overruns += stats.overruns;
    }

    /// Observed channel loss (dropped / sent).
    pub fn loss_rate(&self) -> f64 {
        if self.segments_sent == 0 {
            0.0
        } else {
            self.segments_dropped as f64 / self.segments_sent as f64
        }
    }

    /// Share of sent segments that were repairs.
    pub fn repair_overhead(&self) -> f64 {
        if self.segments_sent == 0 {
            0.0
        } else {
            self.repair_segments_sent as f64 / self.segments_sent as f64
        }
    }

    /// True if every planned block was enqueued, recovered and released.
    pub fn is_success(&self) -> bool {
        self.blocks_enqueued == self.blocks_planned
            && self.blocks_completed == self.blocks_planned
            && self.blocks_released == self.blocks_planned
    }

    /// Print a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n=== Session Summary ===");
        println!("Duration: {} ms", self.duration().as_millis());
        println!("Rounds: {}", self.rounds);
        println!();

        println!("=== Blocks ===");
        println!("Planned: {}", self.blocks_planned);
        println!("Enqueued: {}", self.blocks_enqueued);
        println!("Completed: {}", self.blocks_completed);
        println!("Released: {}", self.blocks_released);
        println!("Enqueue stalls: {}", self.enqueue_stalls);
        println!();

        println!("=== Channel ===");
        println!("Segments sent: {}", self.segments_sent);
        println!(
            "Segments dropped: {} ({:.2}%)",
            self.segments_dropped,
            self.loss_rate() * 100.0
        );
        println!("Segments received: {}", self.segments_received);
        println!("Segments duplicate: {}", self.segments_duplicate);
        println!();

        println!("=== Repair ===");
        println!("NACKs: {} ({} bytes)", self.nacks_sent, self.nack_bytes);
        println!("Descriptors: {}", self.repair_descriptors);
        println!("Advertisements: {}", self.repair_adverts);
        println!("Block resets: {}", self.tx_resets);
        println!(
            "Repair segments: {} ({:.1}% of sent)",
            self.repair_segments_sent,
            self.repair_overhead() * 100.0
        );
        println!();

        println!("=== Resources ===");
        println!("Segment peak usage: {}", self.segment_peak_usage);
        println!("Segment overruns: {}", self.segment_overruns);
        println!("Block overruns: {}", self.block_overruns);
        println!();
    }

    /// Print just the final result (pass/fail).
    pub fn print_result(&self) {
        if self.is_success() {
            println!("✓ All {} blocks delivered", self.blocks_planned);
            println!(
                "  {} segments sent in {} rounds",
                self.segments_sent, self.rounds
            );
        } else {
            println!(
                "✗ Delivery incomplete: {} of {} blocks completed",
                self.blocks_completed, self.blocks_planned
            );
        }
    }

    /// Export metrics as a simple text format (for parsing/testing).
    pub fn export_text(&self) -> String {
        format!(
            "duration_ms={}\n\
             rounds={}\n\
             blocks_enqueued={}\n\
             blocks_completed={}\n\
             segments_sent={}\n\
             segments_dropped={}\n\
             loss_rate={:.4}\n\
             nacks_sent={}\n\
             repair_descriptors={}\n\
             repair_segments_sent={}\n\
             repair_overhead={:.4}\n\
             segment_overruns={}\n",
            self.duration().as_millis(),
            self.rounds,
            self.blocks_enqueued,
            self.blocks_completed,
            self.segments_sent,
            self.segments_dropped,
            self.loss_rate(),
            self.nacks_sent,
            self.repair_descriptors,
            self.repair_segments_sent,
            self.repair_overhead(),
            self.segment_overruns,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert!(metrics.end_time.is_none());
        assert!(metrics.duration().as_millis() < 100); // Should be recent
    }

    #[test]
    fn test_loss_rate() {
        let mut metrics = Metrics::new();
        assert_eq!(metrics.loss_rate(), 0.0);

        metrics.segments_sent = 100;
        metrics.segments_dropped = 5;
        assert_eq!(metrics.loss_rate(), 0.05);
    }

    #[test]
    fn test_repair_overhead() {
        let mut metrics = Metrics::new();
        metrics.segments_sent = 200;
        metrics.repair_segments_sent = 50;

        assert_eq!(metrics.repair_overhead(), 0.25);
    }

    #[test]
    fn test_record_segment_pool() {
        let mut metrics = Metrics::new();
        metrics.record_segment_pool(&PoolStats {
            total: 10,
            free: 4,
            peak_usage: 8,
            overruns: 2,
        });
        metrics.record_segment_pool(&PoolStats {
            total: 10,
            free: 10,
            peak_usage: 3,
            overruns: 1,
        });

        assert_eq!(metrics.segment_peak_usage, 8);
        assert_eq!(metrics.segment_overruns, 3);
    }

    #[test]
    fn test_success_requires_release() {
        let mut metrics = Metrics::new();
        metrics.blocks_planned = 3;
        metrics.blocks_enqueued = 3;
        metrics.blocks_completed = 3;
        assert!(!metrics.is_success());

        metrics.blocks_released = 3;
        assert!(metrics.is_success());
    }

    #[test]
    fn test_success_requires_every_planned_block() {
        let mut metrics = Metrics::new();
        metrics.blocks_planned = 5;
        metrics.blocks_enqueued = 2;
        metrics.blocks_completed = 2;
        metrics.blocks_released = 2;
        assert!(!metrics.is_success());
    }

    #[test]
    fn test_export_text() {
        let mut metrics = Metrics::new();
        metrics.blocks_enqueued = 10;
        metrics.segments_sent = 60;
        metrics.nacks_sent = 4;
        metrics.complete();

        let text = metrics.export_text();
        assert!(text.contains("blocks_enqueued=10"));
        assert!(text.contains("segments_sent=60"));
        assert!(text.contains("nacks_sent=4"));
    }
}
