//! Off-line optimal replacement simulators.
//!
//! [`min::SimMin`] implements Belady's MIN algorithm over a stream of
//! `(key, timestamp)` accesses and exposes the evict/keep sets implied by
//! its capacity barrier. [`opt::SimOpt`] is the bypass-aware variant that
//! withholds a reservation until a key demonstrates reuse.

pub mod min;
pub mod opt;

pub use min::{Reservation, SimMin};
pub use opt::SimOpt;

/// Column index into the capacity vector: one column per demand miss.
/// Absolute, never reset; the trim offset maps it into the live vector.
pub type MinTime = u64;
