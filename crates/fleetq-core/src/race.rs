//! First-settled-wins races between a network call, cancellation and a timer.
//!
//! The losing branches are dropped, not left running: dropping an in-flight
//! SDK future aborts its request, so nothing outlives the race.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How a race ended.
#[derive(Debug)]
pub enum Race<T> {
    /// The call finished first, successfully or not.
    Settled(T),
    Cancelled,
    TimedOut,
}

/// Races `call` against `cancel` and a `limit` timer.
///
/// Cancellation wins ties, so a token cancelled before the race starts always
/// produces [`Race::Cancelled`] without polling the call.
pub async fn race<F>(call: F, cancel: &CancellationToken, limit: Duration) -> Race<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Race::Cancelled,
        output = call => Race::Settled(output),
        _ = tokio::time::sleep(limit) => Race::TimedOut,
    }
}

/// Runs `call` unless `cancel` fires first.
pub async fn or_cancel<F>(call: F, cancel: &CancellationToken) -> Option<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = call => Some(output),
    }
}
