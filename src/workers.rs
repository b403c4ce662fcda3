//! Worker pool & virtual-thread mapping (`spec.md` §4.8, §9).
//!
//! Maps client-side logical thread IDs to dedicated execution contexts
//! that preserve per-logical-thread lock ownership across the pool, and
//! runs asynchronous method calls on a separate unbounded pool of
//! "method caller" tasks that hand back a [`CallFuture`] immediately.
//!
//! Rust has no user-space park/unpark primitive tied to a thread the way
//! the original engine's worker units do; here a "worker" is a `tokio`
//! task and the free list is a bounded `tokio::sync::mpsc` channel of
//! reusable permits, the same shape the teacher gives its `JoinSet` of
//! per-connection tasks in `server/legacy.rs`, just pooled per connection
//! rather than per listener.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{Semaphore, oneshot};

use crate::ids::LogicalThreadId;

/// A virtual thread: the server-side continuation of one client logical
/// thread. Exists so lock ownership is keyed by this identity rather than
/// whichever worker happens to execute a given message (`spec.md` §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualThread(pub LogicalThreadId);

/// Registry mapping client-thread-ids to their [`VirtualThread`], created
/// lazily on first sight per connection (`spec.md` §4.8).
#[derive(Debug, Default)]
pub struct VirtualThreadTable {
    known: Mutex<HashMap<LogicalThreadId, VirtualThread>>,
}

impl VirtualThreadTable {
    /// Construct an empty table.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Look up or create the [`VirtualThread`] owning `id`.
    pub fn get_or_create(&self, id: LogicalThreadId) -> VirtualThread {
        let mut known = self.known.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *known.entry(id).or_insert(VirtualThread(id))
    }
}

/// Bounded admission control standing in for the "free list of worker
/// units" in pooled dispatch mode (`spec.md` §4.8): each in-flight
/// message in pooled mode holds one permit for its duration, so at most
/// `worker_pool_size` messages run concurrently per connection while
/// additional arrivals simply wait rather than being dropped.
#[derive(Debug)]
pub struct WorkerPool {
    admission: Arc<Semaphore>,
}

impl WorkerPool {
    /// Construct a pool admitting at most `size` concurrent workers.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Acquire a worker slot, running `task` once admitted and releasing
    /// the slot when `task` completes (including on panic, since the
    /// permit is dropped via RAII).
    ///
    /// # Panics
    /// Panics only if the underlying semaphore has been closed, which
    /// this type never does.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let permit = Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("WorkerPool never closes its semaphore"));
        let result = task.await;
        drop(permit);
        result
    }
}

/// A future-like handle returned to the client for an asynchronous method
/// call (`spec.md` §4.8, §5): holds a single result or exception and
/// invalidates on first retrieval.
#[derive(Debug)]
pub struct CallFuture<T> {
    receiver: oneshot::Receiver<T>,
}

/// The producing half of a [`CallFuture`], held by the method-caller task
/// that will eventually send the result.
#[derive(Debug)]
pub struct CallFutureSender<T> {
    sender: oneshot::Sender<T>,
}

/// Construct a connected [`CallFuture`]/[`CallFutureSender`] pair.
#[must_use]
pub fn call_future<T>() -> (CallFutureSender<T>, CallFuture<T>) {
    let (sender, receiver) = oneshot::channel();
    (CallFutureSender { sender }, CallFuture { receiver })
}

impl<T> CallFutureSender<T> {
    /// Deliver the result, consuming the sender. Dropping the sender
    /// instead of calling this causes the paired future's wait to fail,
    /// the same as the original engine's "future invalidates on first
    /// retrieval" rule applied to an abandoned call.
    pub fn send(self, value: T) { let _ = self.sender.send(value); }
}

/// Error returned by [`CallFuture::wait`].
#[derive(Debug, thiserror::Error)]
pub enum CallFutureError {
    /// The timed wait expired before a result arrived (`spec.md` §5, §7).
    #[error("future wait timed out")]
    Timeout,
    /// The method-caller task producing the result was dropped without
    /// sending one (e.g. the connection tore down mid-call).
    #[error("method caller dropped without producing a result")]
    Abandoned,
}

impl<T> CallFuture<T> {
    /// Await the result with no timeout. Consumes the future: the
    /// original engine's futures "invalidate on first retrieval"
    /// (`spec.md` §4.8), which Rust's ownership already enforces here.
    ///
    /// # Errors
    /// Returns [`CallFutureError::Abandoned`] if the sender was dropped.
    pub async fn wait(self) -> Result<T, CallFutureError> {
        self.receiver.await.map_err(|_| CallFutureError::Abandoned)
    }

    /// Await the result with a timeout (`spec.md` §5: "futures support a
    /// timed wait with a timeout exception when exceeded").
    ///
    /// # Errors
    /// Returns [`CallFutureError::Timeout`] if `duration` elapses first,
    /// or [`CallFutureError::Abandoned`] if the sender was dropped.
    pub async fn wait_timeout(self, duration: std::time::Duration) -> Result<T, CallFutureError> {
        match tokio::time::timeout(duration, self.receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CallFutureError::Abandoned),
            Err(_) => Err(CallFutureError::Timeout),
        }
    }
}

/// Spawns method calls selected for asynchronous execution onto a
/// dedicated, effectively unbounded pool of tasks (`spec.md` §4.8): the
/// dispatcher hands back a [`CallFuture`] immediately and the call itself
/// runs independently of the message that requested it.
#[derive(Debug, Default, Clone, Copy)]
pub struct MethodCallerPool;

impl MethodCallerPool {
    /// Spawn `action` on a fresh task, returning a future the dispatcher
    /// can hand back to the client immediately.
    pub fn spawn<F>(self, action: F) -> CallFuture<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (sender, future) = call_future();
        tokio::spawn(async move {
            let result = action.await;
            sender.send(result);
        });
        future
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CallFutureError, MethodCallerPool, VirtualThreadTable, WorkerPool};
    use crate::ids::{ClientThreadId, LogicalThreadId};

    #[test]
    fn same_logical_thread_id_maps_to_the_same_virtual_thread() {
        let table = VirtualThreadTable::new();
        let id = LogicalThreadId::new(1, ClientThreadId(7));
        let a = table.get_or_create(id);
        let b = table.get_or_create(id);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn worker_pool_runs_a_task_and_releases_its_slot() {
        let pool = WorkerPool::new(2);
        let result = pool.run(async { 1 + 1 }).await;
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn method_caller_pool_future_resolves_with_the_result() {
        let caller = MethodCallerPool;
        let future = caller.spawn(async { 42 });
        assert_eq!(future.wait().await.expect("result delivered"), 42);
    }

    #[tokio::test]
    async fn future_times_out_when_the_call_never_completes() {
        let (_sender, future) = super::call_future::<i32>();
        let result = future.wait_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(CallFutureError::Timeout)));
    }

    #[tokio::test]
    async fn future_reports_abandoned_when_sender_is_dropped() {
        let (sender, future) = super::call_future::<i32>();
        drop(sender);
        let result = future.wait().await;
        assert!(matches!(result, Err(CallFutureError::Abandoned)));
    }
}
