//! Master timer: drives the tick sequence at a fixed period.
//!
//! Sleeps coarsely until `spin_window` before the deadline, then busy-waits
//! the final slice. A tick that fires later than `late_tolerance` is reported
//! and the schedule re-anchors forward from it; ticks are never replayed.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerConfig {
    pub period: Duration,
    pub late_tolerance: Duration,
    pub spin_window: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(50),
            late_tolerance: Duration::from_micros(100),
            spin_window: Duration::from_millis(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickInfo {
    pub tick: u64,
    pub deadline: Instant,
    pub fired_at: Instant,
    /// `fired_at - deadline`
    pub jitter: Duration,
    /// Set when jitter exceeded the tolerance
    pub lateness: Option<Duration>,
}

impl TickInfo {
    pub fn is_late(&self) -> bool {
        self.lateness.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimerStats {
    pub ticks: u64,
    pub late_ticks: u64,
    pub max_jitter_us: f64,
    pub mean_jitter_us: f64,
}

/// Read-only view of the current tick number
#[derive(Debug, Clone, Default)]
pub struct TickClock(Arc<AtomicU64>);

impl TickClock {
    /// Last tick fired; 0 before the first
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

pub struct MasterTimer {
    config: TimerConfig,
    next_deadline: Option<Instant>,
    clock: TickClock,
    late_ticks: u64,
    max_jitter: Duration,
    total_jitter: Duration,
}

impl MasterTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            config,
            next_deadline: None,
            clock: TickClock::default(),
            late_ticks: 0,
            max_jitter: Duration::ZERO,
            total_jitter: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    pub fn clock(&self) -> TickClock {
        self.clock.clone()
    }

    /// Block until the next deadline and advance the tick sequence by one.
    /// The first call fires immediately.
    pub fn wait_for_next_tick(&mut self) -> TickInfo {
        let deadline = self.next_deadline.unwrap_or_else(Instant::now);

        let now = Instant::now();
        if let Some(coarse) = deadline.checked_sub(self.config.spin_window) {
            if coarse > now {
                std::thread::sleep(coarse - now);
            }
        }
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }

        let fired_at = Instant::now();
        let jitter = fired_at.saturating_duration_since(deadline);
        let tick = self.clock.0.fetch_add(1, Ordering::AcqRel) + 1;

        let lateness = if jitter > self.config.late_tolerance {
            self.late_ticks += 1;
            log::warn!(
                "Tick {} late by {:.3} ms (tolerance {:.3} ms)",
                tick,
                jitter.as_secs_f64() * 1e3,
                self.config.late_tolerance.as_secs_f64() * 1e3
            );
            // Re-anchor: the next tick is one full period after this one.
            self.next_deadline = Some(fired_at + self.config.period);
            Some(jitter)
        } else {
            self.next_deadline = Some(deadline + self.config.period);
            None
        };

        self.max_jitter = self.max_jitter.max(jitter);
        self.total_jitter += jitter;

        TickInfo {
            tick,
            deadline,
            fired_at,
            jitter,
            lateness,
        }
    }

    pub fn stats(&self) -> TimerStats {
        let ticks = self.clock.current();
        let mean = if ticks > 0 {
            self.total_jitter.as_secs_f64() / ticks as f64
        } else {
            0.0
        };
        TimerStats {
            ticks,
            late_ticks: self.late_ticks,
            max_jitter_us: self.max_jitter.as_secs_f64() * 1e6,
            mean_jitter_us: mean * 1e6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(period_ms: u64) -> TimerConfig {
        TimerConfig {
            period: Duration::from_millis(period_ms),
            // Generous so shared CI machines do not flag ticks as late
            late_tolerance: Duration::from_millis(20),
            spin_window: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_ticks_increment_once_per_call() {
        let mut timer = MasterTimer::new(config(5));
        let clock = timer.clock();
        assert_eq!(clock.current(), 0);
        for expected in 1..=4 {
            let info = timer.wait_for_next_tick();
            assert_eq!(info.tick, expected);
            assert_eq!(clock.current(), expected);
        }
        assert_eq!(timer.stats().ticks, 4);
    }

    #[test]
    fn test_period_is_respected() {
        let mut timer = MasterTimer::new(config(10));
        let first = timer.wait_for_next_tick();
        let second = timer.wait_for_next_tick();
        let third = timer.wait_for_next_tick();
        assert!(second.fired_at >= first.fired_at + Duration::from_millis(10));
        assert_eq!(third.deadline - second.deadline, Duration::from_millis(10));
    }

    #[test]
    fn test_late_tick_reported_and_reanchored() {
        let mut timer = MasterTimer::new(TimerConfig {
            period: Duration::from_millis(5),
            late_tolerance: Duration::from_micros(500),
            spin_window: Duration::from_millis(1),
        });
        timer.wait_for_next_tick();
        std::thread::sleep(Duration::from_millis(30));

        let late = timer.wait_for_next_tick();
        assert_eq!(late.tick, 2);
        assert!(late.is_late());
        assert!(late.lateness.unwrap() >= Duration::from_millis(20));

        let next = timer.wait_for_next_tick();
        assert_eq!(next.tick, 3);
        assert_eq!(next.deadline, late.fired_at + Duration::from_millis(5));

        let stats = timer.stats();
        assert!(stats.late_ticks >= 1);
        assert!(stats.max_jitter_us >= 20_000.0);
    }
}
