//! Cross-shard aggregation
//!
//! Three ways of running one per-shard operation over every shard of a
//! mailbox:
//!
//! - [`parallel_reduce`]: all shards, bounded concurrency, fold every result.
//!   Any shard error fails the aggregate once all shards have finished.
//! - [`sequential_accumulate`]: shards in registry order, threading an
//!   accumulator through; each step may stop the walk early.
//! - [`race_first_success`]: all shards, first `Some` wins; errors count as
//!   misses and the caller's fallback is returned when nothing matches.
//!
//! [`with_fallback`] turns a failing per-shard operation into a default value
//! so a single bad shard can be degraded around instead of failing the fold.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MAX_FANOUT_CONCURRENCY;
use crate::error::{MirrorError, Result};
use crate::registry::{ShardRef, ShardRegistry};

/// Outcome of one sequential step
#[derive(Debug, Clone)]
pub struct Step<A> {
    pub should_continue: bool,
    pub accumulator: A,
}

impl<A> Step<A> {
    pub fn next(accumulator: A) -> Self {
        Self {
            should_continue: true,
            accumulator,
        }
    }

    pub fn stop(accumulator: A) -> Self {
        Self {
            should_continue: false,
            accumulator,
        }
    }
}

pub async fn parallel_reduce<T, A, Op, Fut, R>(
    shards: &[ShardRef],
    limit: usize,
    op: Op,
    init: A,
    mut reduce: R,
) -> Result<A>
where
    Op: Fn(ShardRef) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(A, T) -> A,
{
    let mut results = stream::iter(shards.iter().cloned())
        .map(|shard| {
            let shard_id = shard.shard_id.clone();
            let fut = op(shard);
            async move { (shard_id, fut.await) }
        })
        .buffer_unordered(limit.max(1));

    let mut accumulator = init;
    let mut first_error: Option<MirrorError> = None;

    while let Some((shard_id, result)) = results.next().await {
        match result {
            Ok(value) => accumulator = reduce(accumulator, value),
            Err(e) => {
                warn!("Shard {} failed during fan-out: {}", shard_id, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(accumulator),
    }
}

pub async fn sequential_accumulate<A, Out, F, Fut, Fin>(
    shards: &[ShardRef],
    init: A,
    mut step: F,
    finish: Fin,
) -> Result<Out>
where
    F: FnMut(ShardRef, A) -> Fut,
    Fut: Future<Output = Result<Step<A>>>,
    Fin: FnOnce(A) -> Out,
{
    let mut accumulator = init;

    for shard in shards {
        let Step {
            should_continue,
            accumulator: next,
        } = step(shard.clone(), accumulator).await?;
        accumulator = next;

        if !should_continue {
            debug!("Sequential fan-out stopped at shard {}", shard.shard_id);
            break;
        }
    }

    Ok(finish(accumulator))
}

pub async fn race_first_success<T, Op, Fut>(
    shards: &[ShardRef],
    limit: usize,
    op: Op,
    fallback: T,
) -> T
where
    Op: Fn(ShardRef) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut attempts = stream::iter(shards.iter().cloned())
        .map(|shard| {
            let shard_id = shard.shard_id.clone();
            let fut = op(shard);
            async move { (shard_id, fut.await) }
        })
        .buffer_unordered(limit.max(1));

    while let Some((shard_id, result)) = attempts.next().await {
        match result {
            Ok(Some(value)) => return value,
            Ok(None) => {}
            Err(e) => debug!("Shard {} missed during race: {}", shard_id, e),
        }
    }

    fallback
}

/// Await `fut`, logging and substituting `fallback` on error
pub async fn with_fallback<T, Fut>(shard_id: &str, fut: Fut, fallback: T) -> T
where
    Fut: Future<Output = Result<T>>,
{
    match fut.await {
        Ok(value) => value,
        Err(e) => {
            warn!("Shard {} degraded to fallback: {}", shard_id, e);
            fallback
        }
    }
}

/// Combinators bound to the registry, resolving a mailbox's shards per call
#[derive(Clone)]
pub struct FanOut {
    registry: Arc<ShardRegistry>,
    max_concurrency: usize,
}

impl FanOut {
    pub fn new(registry: Arc<ShardRegistry>, max_concurrency: usize) -> Self {
        Self {
            registry,
            max_concurrency: max_concurrency.clamp(1, MAX_FANOUT_CONCURRENCY),
        }
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub async fn parallel_reduce<T, A, Op, Fut, R>(
        &self,
        mailbox_id: &str,
        op: Op,
        init: A,
        reduce: R,
    ) -> Result<A>
    where
        Op: Fn(ShardRef) -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(A, T) -> A,
    {
        let shards = self.registry.shards(mailbox_id).await?;
        parallel_reduce(&shards, self.max_concurrency, op, init, reduce).await
    }

    pub async fn sequential_accumulate<A, Out, F, Fut, Fin>(
        &self,
        mailbox_id: &str,
        init: A,
        step: F,
        finish: Fin,
    ) -> Result<Out>
    where
        F: FnMut(ShardRef, A) -> Fut,
        Fut: Future<Output = Result<Step<A>>>,
        Fin: FnOnce(A) -> Out,
    {
        let shards = self.registry.shards(mailbox_id).await?;
        sequential_accumulate(&shards, init, step, finish).await
    }

    /// Registry failures are still surfaced; shard failures are misses
    pub async fn race_first_success<T, Op, Fut>(
        &self,
        mailbox_id: &str,
        op: Op,
        fallback: T,
    ) -> Result<T>
    where
        Op: Fn(ShardRef) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let shards = self.registry.shards(mailbox_id).await?;
        Ok(race_first_success(&shards, self.max_concurrency, op, fallback).await)
    }
}
