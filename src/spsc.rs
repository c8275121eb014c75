//! Single-producer single-consumer queues.
//!
//! Two variants share the producer-side look-ahead idea:
//! - [`bounded`] - fixed capacity ring, fails `push` when full
//! - [`unbounded`] - grows by linking same-size chunks, `push` never fails
//!
//! Both are wait-free on both sides: no CAS anywhere, only ordered loads
//! and stores on the slot tags and index counters.

pub mod bounded;
pub mod unbounded;
