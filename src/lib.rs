//! flowrelay - durable-queue relay programs
//!
//! Two programs share one session/flow harness:
//! - **Processor**: consumes a durable queue, republishes the upper-cased
//!   source topic of every message on a fixed topic, acknowledges.
//! - **Consumer**: consumes a durable queue and acknowledges.
//!
//! Both print a throughput line every second and stop on operator input,
//! Ctrl+C, or unrecoverable transport loss.

pub mod bus;
pub mod cli;
pub mod config;
pub mod pipeline;
pub mod runtime;
pub mod utils;
