//! # In-Flight Chunk Array
//!
//! This crate provides a bounded-parallelism, order-preserving transform engine
//! for async Rust. Chunks written into an engine are processed concurrently
//! through a chain of transforms, but read back in the order they were written.
//!
//! ## Core Concepts
//!
//! - **Engine** ([`Ifca`]): accepts writes, runs the transform chain for every
//!   chunk on its own task, and serves reads in write order
//! - **Transform**: a sync or async function from one chunk to an
//!   [`Outcome`], which is either a value or `Dropped`
//! - **Error handler**: recovers failures of a transform (paired) or of any
//!   earlier stage (catch-only)
//! - **Drain**: the [`Signal`] returned by `write` once `max_parallel` chunks
//!   are held, resolving when capacity frees up
//! - **Chain** ([`IfcaChain`]): several engines piped into each other
//!
//! ## Example
//!
//! ```rust
//! use ifca::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let ifca = Ifca::<u64>::new(IfcaConfig::new(4))?
//!         .then(|x| async move { x * 2 })
//!         .filter(|x| x % 3 != 0);
//!
//!     let writer = async {
//!         for x in 1..=6 {
//!             // wait for a reader to free capacity
//!             if let Some(drain) = ifca.write(x)? {
//!                 drain.await;
//!             }
//!         }
//!         ifca.end().map(drop)
//!     };
//!
//!     let (written, doubled) = tokio::join!(writer, ifca.read_to_end());
//!     written?;
//!     assert_eq!(doubled, vec![2, 4, 8, 10]);
//!     Ok(())
//! }
//! ```

#[macro_use]
mod tracing_support;

mod backpressure;
mod chain;
mod queue;

pub mod config;
pub mod error;
pub mod ifca;
pub mod ifca_chain;
pub mod signal;
pub mod transform;

// Re-export commonly used items
pub mod prelude {
    pub use crate::config::IfcaConfig;
    pub use crate::error::{Error, IntoError, Result};
    pub use crate::ifca::{FaultHandler, Ifca, IfcaState, Read};
    pub use crate::ifca_chain::{IfcaChain, StageSink, StageSource};
    pub use crate::signal::{Resolvable, Signal};
    pub use crate::transform::{ErrorHandler, Outcome, StageResult, Transform};
}

// Re-export main types
pub use config::IfcaConfig;
pub use error::{Error, Result};
pub use ifca::{Ifca, IfcaState, Read};
pub use ifca_chain::IfcaChain;
pub use signal::Signal;
pub use transform::{ErrorHandler, Outcome, Transform};

// Feature flags for optional dependencies
#[cfg(feature = "metrics")]
pub mod metrics;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
