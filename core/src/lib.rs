//! A research dataplane core for learned flow-state caching.
//!
//! flowsim decodes a packet stream into flow identifiers, keeps each flow in
//! a bounded associative cache, and lets a learned policy pick eviction
//! victims. The learner is a hashed perceptron trained online, either from
//! a delayed prediction-versus-reality feedback loop or from a Belady (MIN)
//! oracle computed by a companion simulator over the same access stream.
//!
//! The crate is organized as the data flows:
//!
//! - [`protocols`] — bounded packet views and layered header extraction
//! - [`flowtable`] — 5-tuple to flow-id mapping and per-flow records
//! - [`features`] — fixed-width feature vectors over flow and cache state
//! - [`perceptron`] — hashed-perceptron inference and training
//! - [`cache`] — the associative cache with pluggable policies
//! - [`sim`] — MIN and OPT reference simulators
//! - [`runtime`] — the per-packet pipeline gluing the above together
//!
//! A minimal driver feeds capture buffers to a [`Pipeline`]:
//!
//! ```no_run
//! use flowsim_core::config::default_config;
//! use flowsim_core::runtime::{PacketRef, Pipeline};
//! use flowsim_core::utils::TimeSpec;
//!
//! let mut pipeline = Pipeline::new(default_config()).unwrap();
//! let frame: &[u8] = &[/* captured bytes */];
//! pipeline.process(&PacketRef {
//!     port: 0,
//!     ts: TimeSpec::new(0, 0),
//!     data: frame,
//!     captured_len: frame.len(),
//!     wire_len: frame.len(),
//! });
//! println!("{}", pipeline.finish());
//! ```
//!
//! The core is single-threaded-cooperative over one packet stream: within a
//! flow, packets must arrive in capture order, and at most one thread may
//! drive a pipeline. Concurrent consumers may sample retired flows through
//! the mutex-guarded [`sampling::SampleHub`].

pub mod cache;
pub mod config;
pub mod features;
pub mod flowtable;
pub mod output;
pub mod perceptron;
pub mod protocols;
pub mod runtime;
pub mod sampling;
pub mod sim;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

pub use self::flowtable::{FlowId, FlowTable};
pub use self::protocols::{Fields, FlowKey};
pub use self::runtime::{PacketRef, Pipeline};
pub use self::sampling::SampleHub;
