//! # Ember Streams
//!
//! Pull-based streams compiled onto the ember runtime:
//!
//! - **Streams**: [`Stream<F, O>`] values describing effectful sequences
//! - **Pulls**: [`Pull<F, O, R>`] programs for writing transformations
//! - **Scopes**: a [`CompileScope`] tree that owns every acquired
//!   [`Resource`] and releases it exactly once
//! - **Interruption**: interruptible scopes that stop evaluation early and
//!   still run finalizers
//! - **Compilation**: [`Compiler`] folds a stream into a single effect
//!
//! ## Architecture
//!
//! ```text
//! Stream / Pull ──▶ FreeC program ──▶ compiler ──▶ F::Of<B>
//!                                       │
//!                                       ▼
//!                              CompileScope tree
//!                              (resources, leases,
//!                               interruption)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_runtime::{IoEffect, IO};
//! use ember_stream::Stream;
//!
//! let total = Stream::<IoEffect, _>::emits(1..=10)
//!     .filter(|n| n % 2 == 0)
//!     .eval_map(|n| IO::delay(move || n * 10))
//!     .compile()
//!     .fold(0, |acc, n| acc + n);
//!
//! assert_eq!(total.unsafe_run_sync().unwrap(), 300);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod algebra;
pub mod chunk;
pub mod compiler;
pub mod interrupt;
pub mod pull;
pub mod resource;
pub mod scope;
pub mod stream;
pub mod token;

// Re-exports
pub use algebra::Finalizer;
pub use chunk::Chunk;
pub use compiler::Compiler;
pub use interrupt::{Interrupt, Interruptible};
pub use pull::{Pull, ToPull};
pub use resource::{Lease, Resource};
pub use scope::CompileScope;
pub use stream::Stream;
pub use token::Token;
