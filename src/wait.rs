//! Pluggable idle-backoff and exit hooks for the blocking queue operations.
//!
//! The queues never block at the syscall level: the blocking fill/drain
//! wrappers are cooperative loops over the non-blocking primitives, and the
//! two traits here are the only extension points. A [`WaitStrategy`]
//! transforms an idle counter on every unproductive pass (and is where a
//! caller puts spinning, yielding, or sleeping); an [`ExitCondition`] is
//! polled to decide whether the loop keeps running (and is where a caller
//! puts stop flags or deadlines). Neither the queues nor the wrappers carry
//! built-in timeouts or cancellation.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use weft::wait::{ExitCondition, YieldWait};
//!
//! let running = Arc::new(AtomicBool::new(true));
//! let _strategy = YieldWait::default();
//!
//! // Any closure is an exit condition; a shared stop flag is the usual one.
//! let flag = Arc::clone(&running);
//! let condition = move || flag.load(Ordering::Relaxed);
//!
//! running.store(false, Ordering::Relaxed);
//! assert!(!condition.keep_running());
//! ```

use std::time::Duration;

use minstant::Instant;

/// Idle-backoff transform applied when a blocking loop makes no progress.
///
/// Receives the current idle counter and returns the next one; the counter
/// resets to zero whenever the loop moves an element. Implementations decide
/// what "idling once" costs: a spin hint, a yield, a sleep.
pub trait WaitStrategy {
    fn idle(&self, idle_count: usize) -> usize;
}

impl<F: Fn(usize) -> usize> WaitStrategy for F {
    fn idle(&self, idle_count: usize) -> usize {
        self(idle_count)
    }
}

/// Polled by blocking loops; returning `false` ends the loop.
pub trait ExitCondition {
    fn keep_running(&self) -> bool;
}

impl<F: Fn() -> bool> ExitCondition for F {
    fn keep_running(&self) -> bool {
        self()
    }
}

/// Busy-spins with a CPU relax hint on every idle pass.
///
/// Lowest latency, full core burn; for dedicated threads only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpinWait;

impl WaitStrategy for SpinWait {
    fn idle(&self, idle_count: usize) -> usize {
        std::hint::spin_loop();
        idle_count + 1
    }
}

/// Spins for a bounded number of passes, then yields the thread.
#[derive(Debug, Clone, Copy)]
pub struct YieldWait {
    /// Idle passes spent spinning before each pass starts yielding.
    pub spin_limit: usize,
}

impl Default for YieldWait {
    fn default() -> Self {
        Self { spin_limit: 128 }
    }
}

impl WaitStrategy for YieldWait {
    fn idle(&self, idle_count: usize) -> usize {
        if idle_count < self.spin_limit {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
        idle_count + 1
    }
}

/// Never exits; the loop runs until its counterpart endpoint disappears or
/// the process ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunForever;

impl ExitCondition for RunForever {
    fn keep_running(&self) -> bool {
        true
    }
}

/// Exits once a deadline passes.
///
/// The deadline is checked on every poll, so the loop overshoots by at most
/// one batch attempt.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineCondition {
    deadline: Instant,
}

impl DeadlineCondition {
    /// A condition that keeps the loop running for `duration` from now.
    #[must_use]
    pub fn after(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
        }
    }
}

impl ExitCondition for DeadlineCondition {
    fn keep_running(&self) -> bool {
        Instant::now() <= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_wait_counts_up() {
        let w = SpinWait;
        assert_eq!(w.idle(0), 1);
        assert_eq!(w.idle(41), 42);
    }

    #[test]
    fn yield_wait_counts_past_its_spin_limit() {
        let w = YieldWait { spin_limit: 2 };
        let mut idle = 0;
        for _ in 0..5 {
            idle = w.idle(idle);
        }
        assert_eq!(idle, 5);
    }

    #[test]
    fn closures_are_strategies_and_conditions() {
        let strategy = |idle: usize| idle + 10;
        assert_eq!(strategy.idle(5), 15);

        let condition = || false;
        assert!(!condition.keep_running());
    }

    #[test]
    fn stop_flag_closure_is_an_exit_condition() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let flag = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&flag);
        let condition = move || shared.load(Ordering::Relaxed);
        assert!(condition.keep_running());
        flag.store(false, Ordering::Relaxed);
        assert!(!condition.keep_running());
    }

    #[test]
    fn deadline_expires() {
        let condition = DeadlineCondition::after(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!condition.keep_running());

        let generous = DeadlineCondition::after(Duration::from_secs(3600));
        assert!(generous.keep_running());
    }
}
