use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub mod kv_state;
pub mod replay_window;
pub mod router;

pub use router::ShardRouter;

/// Single-writer state owned by one actor task. Operations for a given actor
/// are applied strictly in arrival order; `apply` runs to completion without
/// interleaving with any other operation on the same state.
pub trait ActorState: Send + 'static {
    type Op: Send + 'static;
    type Reply: Send + 'static;

    fn apply(&mut self, op: Self::Op, now: DateTime<Utc>) -> Self::Reply;

    /// Alarm-driven collection of expired records. Returns the number of
    /// keys deleted.
    fn sweep(&mut self, now: DateTime<Utc>) -> usize;
}

struct Envelope<S: ActorState> {
    op: S::Op,
    reply: oneshot::Sender<S::Reply>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorError {
    #[error("actor {0} unavailable")]
    Unavailable(String),
}

/// Handle to a spawned actor. Cloning the handle shares the same mailbox;
/// the actor task exits once every handle is dropped.
pub struct ActorHandle<S: ActorState> {
    identity: String,
    tx: mpsc::Sender<Envelope<S>>,
}

impl<S: ActorState> Clone for ActorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<S: ActorState> ActorHandle<S> {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Send an operation and await its reply. A transient mailbox failure is
    /// retried once before surfacing as `Unavailable`; callers map that to
    /// `server_error`.
    pub async fn call(&self, op: S::Op) -> Result<S::Reply, ActorError>
    where
        S::Op: Clone,
    {
        match self.try_call(op.clone()).await {
            Ok(reply) => Ok(reply),
            Err(_) => self.try_call(op).await,
        }
    }

    /// Single-attempt variant for non-cloneable operations.
    pub async fn call_once(&self, op: S::Op) -> Result<S::Reply, ActorError> {
        self.try_call(op).await
    }

    async fn try_call(&self, op: S::Op) -> Result<S::Reply, ActorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope { op, reply: reply_tx })
            .await
            .map_err(|_| ActorError::Unavailable(self.identity.clone()))?;
        reply_rx
            .await
            .map_err(|_| ActorError::Unavailable(self.identity.clone()))
    }
}

/// Spawn an actor task owning `state`. The task serializes operations and
/// runs an expiry sweep on the given alarm interval.
pub fn spawn<S: ActorState>(identity: String, mut state: S, sweep_every: Duration) -> ActorHandle<S> {
    let (tx, mut rx) = mpsc::channel::<Envelope<S>>(256);
    let task_identity = identity.clone();

    tokio::spawn(async move {
        let mut alarm = tokio::time::interval(sweep_every);
        alarm.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the immediate first tick so the initial sweep is deferred.
        alarm.tick().await;

        loop {
            tokio::select! {
                envelope = rx.recv() => {
                    match envelope {
                        Some(Envelope { op, reply }) => {
                            let out = state.apply(op, Utc::now());
                            let _ = reply.send(out);
                        }
                        None => break,
                    }
                }
                _ = alarm.tick() => {
                    let deleted = state.sweep(Utc::now());
                    if deleted > 0 {
                        tracing::debug!(actor = %task_identity, deleted, "expired records collected");
                    }
                }
            }
        }

        tracing::debug!(actor = %task_identity, "actor stopped");
    });

    ActorHandle { identity, tx }
}

/// A region-sharded family of actors of one kind. `(tenant, key)` pairs are
/// routed to a stable shard; distinct shards execute in parallel while each
/// shard stays single-writer.
pub struct ShardedStore<S: ActorState> {
    router: ShardRouter,
    shards: Vec<ActorHandle<S>>,
}

impl<S: ActorState> Clone for ShardedStore<S> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
            shards: self.shards.clone(),
        }
    }
}

impl<S: ActorState> ShardedStore<S> {
    pub fn spawn_with<F>(router: ShardRouter, sweep_every: Duration, mut make_state: F) -> Self
    where
        F: FnMut(usize) -> S,
    {
        let shards = (0..router.shard_count())
            .map(|i| spawn(router.identity(i, "root"), make_state(i), sweep_every))
            .collect();
        Self { router, shards }
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn handle_for(&self, tenant: &str, key: &str) -> &ActorHandle<S> {
        &self.shards[self.router.shard_for(tenant, key)]
    }

    pub fn handle_at(&self, shard: usize) -> Option<&ActorHandle<S>> {
        self.shards.get(shard)
    }

    pub fn handles(&self) -> &[ActorHandle<S>] {
        &self.shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Counter {
        values: HashMap<String, i64>,
    }

    enum CounterOp {
        Add(String, i64),
        Get(String),
    }

    impl ActorState for Counter {
        type Op = CounterOp;
        type Reply = i64;

        fn apply(&mut self, op: Self::Op, _now: DateTime<Utc>) -> i64 {
            match op {
                CounterOp::Add(key, by) => {
                    let slot = self.values.entry(key).or_insert(0);
                    *slot += by;
                    *slot
                }
                CounterOp::Get(key) => self.values.get(&key).copied().unwrap_or(0),
            }
        }

        fn sweep(&mut self, _now: DateTime<Utc>) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn operations_are_serialized_per_actor() {
        let handle = spawn(
            "g1:auto:0:test".to_string(),
            Counter { values: HashMap::new() },
            Duration::from_secs(60),
        );

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move {
                h.call_once(CounterOp::Add("k".to_string(), 1)).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let total = handle.call_once(CounterOp::Get("k".to_string())).await.unwrap();
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn sharded_store_routes_stably() {
        let router = ShardRouter::new(1, "auto", 4);
        let store = ShardedStore::spawn_with(router, Duration::from_secs(60), |_| Counter {
            values: HashMap::new(),
        });

        let first = store.router().shard_for("t1", "some-key");
        for _ in 0..10 {
            assert_eq!(store.router().shard_for("t1", "some-key"), first);
        }
        assert!(store.handle_at(first).is_some());
    }
}
