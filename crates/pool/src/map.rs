//! Convenience helpers over independent jobs.

use std::future::Future;

use crate::ops::Pool;
use crate::types::{TaskError, TaskId, TaskOutcome};

/// Submits every body to the pool and awaits all outcomes, returned in
/// submission order. Concurrency is bounded by the pool's slot limit.
pub async fn map_tasks<T, I, F>(pool: &Pool<T>, bodies: I) -> Vec<TaskOutcome<T>>
where
	T: Send + 'static,
	I: IntoIterator<Item = F>,
	F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
	let ids: Vec<TaskId> = bodies.into_iter().map(|body| pool.submit(body)).collect();
	let mut outcomes = Vec::with_capacity(ids.len());
	for id in ids {
		outcomes.push(pool.outcome(id).await);
	}
	outcomes
}

/// Like [`map_tasks`], but collects the values and surfaces the first
/// failure. Later tasks still run to completion; their results are consumed
/// and discarded.
pub async fn try_map_tasks<T, I, F>(pool: &Pool<T>, bodies: I) -> Result<Vec<T>, TaskError>
where
	T: Send + 'static,
	I: IntoIterator<Item = F>,
	F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
	map_tasks(pool, bodies).await.into_iter().collect()
}
