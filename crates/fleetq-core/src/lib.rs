//! # fleetq-core
//!
//! Core library for operating a fleet of Lambda collectors and the SQS
//! queues that feed them.
//!
//! The centre of the crate is the [`Drainer`]: a bounded-time, multi-phase
//! receive loop that inspects what is sitting in a queue without deleting
//! anything, reporting progress while it runs and honouring cancellation.
//!
//! ## Features
//!
//! - **Queue Draining**: status probe, quick poll, then long polls within a time budget
//! - **Progress**: elapsed time, phase and poll count on a watch channel
//! - **Client Cache**: one SDK client per profile and region
//! - **Fleet Operations**: functions, event source mappings, logs, package redeploys
//!
//! ## Example
//!
//! ```no_run
//! use fleetq::{ClientProvider, DrainRequest, Drainer, ProgressReporter};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let clients = ClientProvider::default();
//! let sqs = clients.sqs("default", "us-east-1").await;
//!
//! let request = DrainRequest {
//!     profile: "default".into(),
//!     region: "us-east-1".into(),
//!     queue_url: "https://sqs.us-east-1.amazonaws.com/123456789012/state".into(),
//! };
//! let (progress, _watch) = ProgressReporter::channel();
//!
//! match Drainer::new(sqs).drain(&request, &CancellationToken::new(), progress).await {
//!     Ok(result) => println!("{} messages via {}", result.messages.len(), result.strategy),
//!     Err(failure) => eprintln!("{failure}"),
//! }
//! # }
//! ```

mod client;
pub mod controller;
mod drain;
mod error;
pub mod functions;
pub mod logs;
pub mod packages;
pub mod profiles;
mod progress;
mod queue;
mod race;
mod status;

#[cfg(test)]
mod test_utils;

pub use client::*;
pub use drain::*;
pub use error::*;
pub use progress::*;
pub use queue::*;
pub use race::*;
pub use status::*;
