//! Test module for the task cache.
//!
//! - Integration tests (end-to-end scheduling scenarios spanning the cache, queue, and
//!   worker pool together — the kind of coverage a single unit test file can't reach).
//! - Fuzz-style tests (randomized operation sequences checking nothing panics and
//!   invariants hold, without a dedicated `cargo fuzz` harness).

pub mod fuzz;
pub mod integration;
