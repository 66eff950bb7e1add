//! Allocation tracing for finding memory leaks.
//!
//! [`Tracer`] wraps a [`GlobalAlloc`](std::alloc::GlobalAlloc) and records every
//! live allocation made through it. At [`Level::Bytes`] it keeps sizes and
//! allocation order; at [`Level::Stacks`] it also captures the call stack of each
//! allocation, storing each distinct stack once. A dump reports what is still
//! live in three views: oldest first, stacks by bytes and stacks by count.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use memtrace::{Level, Tracer};
//! use std::alloc::System;
//!
//! #[global_allocator]
//! static GLOBAL: Tracer = Tracer::global(System, Level::Stacks, 8);
//!
//! #[memtrace::main(tracer = GLOBAL)]
//! fn main() {
//!     let cache: &'static mut Vec<u64> = Box::leak(Box::default());
//!     cache.extend(0..100);
//! }
//! ```
//!
//! The default sink emits report lines through `tracing` at TRACE level under the
//! `memtrace` target. Set `MEMTRACE_FORMAT` to `table`, `json` or `json-pretty` to
//! print to stdout instead, or install a custom [`Reporter`].

pub use memtrace_macros::main;

pub(crate) mod alloc;
pub mod config;
pub mod error;
pub mod guard;
pub mod level;
pub mod output;
pub mod report;
pub(crate) mod stack;
pub mod tracer;

pub use alloc::shared::format_bytes;
pub use config::{Format, TracerBuilder};
pub use error::ConfigError;
pub use guard::{DumpGuard, PeriodicDump};
pub use level::Level;
pub use output::{JsonPrettyReporter, JsonReporter, Reporter, TableReporter, TracingReporter};
pub use report::{Leak, LeakReport, SizePercentile, StackSummary};
pub use stack::StackId;
pub use tracer::Tracer;
