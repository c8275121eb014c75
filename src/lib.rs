//! Lock-free queues for message passing between threads of one process.
//!
//! A family of ring-buffer queues tuned for high-throughput pipelines, one
//! per producer/consumer cardinality:
//!
//! - [`spsc::bounded`] - single producer, single consumer, fixed capacity;
//!   wait-free on both sides with look-ahead batching
//! - [`spsc::unbounded`] - single producer, single consumer, grows by
//!   linking chunks; wait-free on both sides
//! - [`spmc`] - single producer, many consumers racing via CAS, fixed
//!   capacity
//! - [`mpsc`] - many producers, single consumer, grows by linking chunks
//!   (with or without a capacity ceiling)
//!
//! Every queue hands out a `(Producer, Consumer)` pair; the handle types
//! encode the cardinality (only the multi-endpoint role is `Clone`), so a
//! second thread in a single-endpoint role is a compile error rather than a
//! data race.
//!
//! Full and empty are plain return values, never errors: `push` gives the
//! element back in [`Full`], `pop` returns an `Option`. Blocking variants
//! are cooperative loops parameterized by [`wait::WaitStrategy`] and
//! [`wait::ExitCondition`]; nothing in the crate takes a lock or parks a
//! thread.
//!
//! # Example
//!
//! ```
//! let (mut tx, mut rx) = weft::spsc::bounded::channel::<u64>(1024)?;
//!
//! std::thread::spawn(move || {
//!     for i in 0..100 {
//!         while tx.push(i).is_err() {
//!             std::hint::spin_loop();
//!         }
//!     }
//! });
//!
//! let mut received = 0;
//! while received < 100 {
//!     if let Some(i) = rx.pop() {
//!         assert_eq!(i, received);
//!         received += 1;
//!     }
//! }
//! # Ok::<(), weft::CapacityError>(())
//! ```

mod chunk;
mod ring;
mod slot;

pub mod mpsc;
pub mod spmc;
pub mod spsc;
pub mod trace;
pub mod wait;

pub use ring::{CapacityError, Full, MAX_LOOK_AHEAD};
