//! A bounded, elastic pool of authenticated connections to one node.
//! Operations enter a shared intake queue; every live connection runs a
//! single-slot consumer that takes one operation at a time, so a
//! connection never interleaves dispatches. Dead connections requeue the
//! operation they were about to send and retire themselves.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, Connector, Endpoint, NegotiatedSession, SessionOptions};
use crate::error::Error;
use crate::protocol::Packet;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub queue_capacity: usize,
    pub controller_interval: Duration,
    /// A connection must sit idle at least this long before the scale
    /// controller will shrink the pool.
    pub scale_down_idle: Duration,
    /// Bounded replacement attempts per cleanup pass; the controller
    /// retries on its next tick.
    pub replacement_attempts: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            min_size: 2,
            max_size: 5,
            queue_capacity: 1024,
            controller_interval: Duration::from_secs(1),
            scale_down_idle: Duration::from_secs(60),
            replacement_attempts: 3,
        }
    }
}

impl PoolOptions {
    pub fn fixed(size: usize) -> Self {
        PoolOptions {
            min_size: size,
            max_size: size,
            ..PoolOptions::default()
        }
    }

    pub fn with_sizes(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }
}

struct QueuedOp {
    packet: Packet,
    reply: oneshot::Sender<Result<Packet, Error>>,
    cancel: CancellationToken,
}

struct Member<IO> {
    connection: Arc<Connection<IO>>,
    stop: CancellationToken,
}

struct PoolInner<IO> {
    members: Vec<Member<IO>>,
}

/// Guard returned by [`ConnectionPool::freeze`]; while it lives, no
/// structural mutation (scaling, dead cleanup, dispose teardown) can
/// make progress.
pub struct PoolFreezeGuard<IO> {
    _guard: OwnedMutexGuard<PoolInner<IO>>,
}

pub struct ConnectionPool<C: Connector> {
    connector: Arc<C>,
    endpoint: Endpoint,
    options: PoolOptions,
    session: SyncMutex<SessionOptions>,
    queue_tx: mpsc::Sender<QueuedOp>,
    queue_rx: Arc<Mutex<mpsc::Receiver<QueuedOp>>>,
    inner: Arc<Mutex<PoolInner<C::IO>>>,
    negotiated: SyncMutex<Option<Arc<NegotiatedSession>>>,
    size: AtomicUsize,
    disposed: AtomicBool,
    controller: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(
        connector: Arc<C>,
        endpoint: Endpoint,
        options: PoolOptions,
        session: SessionOptions,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(options.queue_capacity.max(1));
        Arc::new(ConnectionPool {
            connector,
            endpoint,
            options,
            session: SyncMutex::new(session),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            inner: Arc::new(Mutex::new(PoolInner {
                members: Vec::new(),
            })),
            negotiated: SyncMutex::new(None),
            size: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            controller: SyncMutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Operations accepted but not yet picked up by a consumer.
    pub fn pending_sends(&self) -> usize {
        self.options
            .queue_capacity
            .saturating_sub(self.queue_tx.capacity())
    }

    /// Open `min_size` connections in parallel. Partial success is
    /// retained; only a completely failed bootstrap is an error. Starts
    /// the scale controller.
    pub async fn initialize(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), Error> {
        let attempts = (0..self.options.min_size).map(|_| self.open_connection(cancel));
        let results = join_all(attempts).await;

        let mut opened = Vec::new();
        for result in results {
            match result {
                Ok(connection) => opened.push(connection),
                Err(err) => {
                    tracing::warn!(endpoint = %self.endpoint, error = %err, "connection failed during pool bootstrap");
                }
            }
        }
        if opened.is_empty() {
            return Err(Error::Bootstrap(self.endpoint.to_string()));
        }

        {
            let mut inner = self.inner.lock().await;
            for connection in opened {
                let member = self.spawn_consumer(connection);
                inner.members.push(member);
            }
            self.size.store(inner.members.len(), Ordering::Release);
        }

        self.start_controller();
        tracing::debug!(endpoint = %self.endpoint, size = self.size(), "pool initialized");
        Ok(())
    }

    /// Enqueue one operation. Suspends while the intake queue is at
    /// capacity, preserving client submission order. If the pool has no
    /// live connections, dead cleanup runs first so the queue has a
    /// chance of draining.
    pub async fn queue_send(
        self: &Arc<Self>,
        packet: Packet,
        cancel: CancellationToken,
    ) -> Result<oneshot::Receiver<Result<Packet, Error>>, Error> {
        if self.is_disposed() {
            return Err(Error::PoolDisposed);
        }
        if self.size() == 0 {
            self.cleanup_dead_connections().await;
        }

        let (reply, reply_rx) = oneshot::channel();
        let op = QueuedOp {
            packet,
            reply,
            cancel,
        };
        self.queue_tx
            .send(op)
            .await
            .map_err(|_| Error::PoolDisposed)?;
        Ok(reply_rx)
    }

    /// Enqueue and await the response.
    pub async fn send(
        self: &Arc<Self>,
        packet: Packet,
        cancel: CancellationToken,
    ) -> Result<Packet, Error> {
        let reply_rx = self.queue_send(packet, cancel.clone()).await?;
        tokio::select! {
            result = reply_rx => result.map_err(|_| Error::PoolDisposed)?,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Grow (`delta > 0`, up to `max_size`) or shrink (`delta < 0`, down
    /// to `min_size`). Shrinking picks the longest-idle connections that
    /// have nothing in flight; their sockets close in the background and
    /// this call does not wait for them.
    pub async fn scale(self: &Arc<Self>, delta: i64) {
        if self.is_disposed() || delta == 0 {
            return;
        }
        let mut inner = self.inner.lock().await;
        if delta > 0 {
            let target = (inner.members.len() + delta as usize).min(self.options.max_size);
            while inner.members.len() < target {
                match self.open_connection(&CancellationToken::new()).await {
                    Ok(connection) => {
                        let member = self.spawn_consumer(connection);
                        inner.members.push(member);
                    }
                    Err(err) => {
                        tracing::warn!(endpoint = %self.endpoint, error = %err, "scale-up connection failed");
                        break;
                    }
                }
            }
        } else {
            let removable = inner.members.len().saturating_sub(self.options.min_size);
            let count = removable.min(delta.unsigned_abs() as usize);
            for _ in 0..count {
                let victim = inner
                    .members
                    .iter()
                    .enumerate()
                    .filter(|(_, member)| member.connection.in_flight() == 0)
                    .max_by_key(|(_, member)| {
                        (member.connection.idle_time(), member.connection.id())
                    })
                    .map(|(index, _)| index);
                let index = match victim {
                    Some(index) => index,
                    None => break,
                };
                let member = inner.members.remove(index);
                member.stop.cancel();
                let connection = member.connection;
                tracing::debug!(endpoint = %self.endpoint, connection = connection.id(), "scaling down");
                tokio::spawn(async move {
                    connection.close(Duration::from_secs(5)).await;
                });
            }
        }
        self.size.store(inner.members.len(), Ordering::Release);
    }

    /// Remove every dead connection and try to replace up to `min_size`.
    /// Replacement failures are logged; the scale controller retries on
    /// its next tick, so the pool may sit below `min_size` temporarily.
    pub async fn cleanup_dead_connections(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let mut inner = self.inner.lock().await;

        let mut retained = Vec::with_capacity(inner.members.len());
        let mut removed = 0;
        for member in inner.members.drain(..) {
            if member.connection.is_dead() {
                removed += 1;
                member.stop.cancel();
                let connection = member.connection;
                tokio::spawn(async move {
                    connection.close(Duration::from_millis(0)).await;
                });
            } else {
                retained.push(member);
            }
        }
        inner.members = retained;
        if removed > 0 {
            tracing::debug!(endpoint = %self.endpoint, removed, "removed dead connections");
        }

        let mut attempts = 0;
        while inner.members.len() < self.options.min_size
            && attempts < self.options.replacement_attempts
        {
            attempts += 1;
            match self.open_connection(&CancellationToken::new()).await {
                Ok(connection) => {
                    let member = self.spawn_consumer(connection);
                    inner.members.push(member);
                }
                Err(err) => {
                    tracing::warn!(endpoint = %self.endpoint, error = %err, "failed to open replacement connection");
                }
            }
        }
        self.size.store(inner.members.len(), Ordering::Release);
    }

    /// Take the pool-exclusive lock. Structural mutation blocks until the
    /// guard drops.
    pub async fn freeze(&self) -> PoolFreezeGuard<C::IO> {
        PoolFreezeGuard {
            _guard: self.inner.clone().lock_owned().await,
        }
    }

    /// Issue SELECT_BUCKET on every connection while holding the
    /// structural lock, then remember the bucket for connections opened
    /// later.
    pub async fn select_bucket(&self, bucket: &str) -> Result<(), Error> {
        let inner = self.inner.lock().await;
        let cancel = CancellationToken::new();
        for member in &inner.members {
            member.connection.select_bucket(bucket, &cancel).await?;
        }
        self.session.lock().bucket = Some(bucket.to_string());
        Ok(())
    }

    /// Cancel the controller, fail everything still queued, dispose every
    /// connection. Permanent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(controller) = self.controller.lock().take() {
            controller.abort();
        }
        self.shutdown.cancel();

        {
            let mut queue_rx = self.queue_rx.lock().await;
            queue_rx.close();
            while let Ok(op) = queue_rx.try_recv() {
                let _ = op.reply.send(Err(Error::PoolDisposed));
            }
        }

        let mut inner = self.inner.lock().await;
        for member in inner.members.drain(..) {
            member.stop.cancel();
            member.connection.close(Duration::from_millis(250)).await;
        }
        self.size.store(0, Ordering::Release);
        tracing::debug!(endpoint = %self.endpoint, "pool disposed");
    }

    /// What the most recent connection negotiated: session features and
    /// the server error map.
    pub fn negotiated_session(&self) -> Option<Arc<NegotiatedSession>> {
        self.negotiated.lock().clone()
    }

    async fn open_connection(&self, cancel: &CancellationToken) -> Result<Arc<Connection<C::IO>>, Error> {
        let io = self.connector.connect(&self.endpoint).await?;
        let connection = Connection::spawn(io, self.endpoint.clone());
        let session = self.session.lock().clone();
        let negotiated = connection.initialize(&session, cancel).await?;
        *self.negotiated.lock() = Some(Arc::new(negotiated));
        Ok(connection)
    }

    /// Attach a single-slot consumer to the connection: it takes one
    /// operation at a time from the shared intake queue. A consumer that
    /// observes its connection dead hands the operation back to the queue
    /// and schedules dead cleanup.
    fn spawn_consumer(self: &Arc<Self>, connection: Arc<Connection<C::IO>>) -> Member<C::IO> {
        let stop = CancellationToken::new();
        let queue_rx = self.queue_rx.clone();
        let requeue_tx = self.queue_tx.clone();
        let pool = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let consumer_stop = stop.clone();
        let consumer_conn = connection.clone();

        tokio::spawn(async move {
            loop {
                let op = {
                    let mut queue_rx = queue_rx.lock().await;
                    tokio::select! {
                        _ = shutdown.cancelled() => None,
                        _ = consumer_stop.cancelled() => None,
                        op = queue_rx.recv() => op,
                    }
                };
                let op = match op {
                    Some(op) => op,
                    None => break,
                };

                if consumer_conn.is_dead() {
                    // hand the operation back, never drop it
                    if requeue_tx.send(op).await.is_err() {
                        break;
                    }
                    if let Some(pool) = pool.upgrade() {
                        tokio::spawn(async move {
                            pool.cleanup_dead_connections().await;
                        });
                    }
                    break;
                }

                if op.cancel.is_cancelled() || op.reply.is_closed() {
                    let _ = op.reply.send(Err(Error::Cancelled));
                    continue;
                }

                let result = consumer_conn.send(op.packet, &op.cancel).await;
                let _ = op.reply.send(result);

                if consumer_stop.is_cancelled() {
                    break;
                }
            }
        });

        Member { connection, stop }
    }

    fn start_controller(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let interval = self.options.controller_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let pool = match pool.upgrade() {
                    Some(pool) => pool,
                    None => break,
                };
                if pool.is_disposed() {
                    break;
                }
                pool.control_tick().await;
            }
        });
        *self.controller.lock() = Some(handle);
    }

    async fn control_tick(self: &Arc<Self>) {
        let needs_cleanup = {
            let inner = self.inner.lock().await;
            inner.members.iter().any(|member| member.connection.is_dead())
                || inner.members.len() < self.options.min_size
        };
        if needs_cleanup {
            self.cleanup_dead_connections().await;
        }

        let pending = self.pending_sends();
        let size = self.size();
        if pending > size && size < self.options.max_size {
            self.scale(1).await;
        } else if pending == 0 && size > self.options.min_size {
            let all_idle = {
                let inner = self.inner.lock().await;
                inner.members.iter().all(|member| {
                    member.connection.in_flight() == 0
                        && member.connection.idle_time() >= self.options.scale_down_idle
                })
            };
            if all_idle {
                self.scale(-1).await;
            }
        }
    }

    pub async fn connection_ids(&self) -> Vec<u64> {
        let inner = self.inner.lock().await;
        inner
            .members
            .iter()
            .map(|member| member.connection.id())
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn connections_for_test(&self) -> Vec<Arc<Connection<C::IO>>> {
        let inner = self.inner.lock().await;
        inner
            .members
            .iter()
            .map(|member| member.connection.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{ConnectionPool, PoolOptions};
    use crate::connection::{Endpoint, SessionOptions};
    use crate::protocol::request::{DocKey, GetRequest};
    use crate::protocol::Packet;
    use crate::testutil::MockConnector;

    fn pool_with(
        connector: MockConnector,
        options: PoolOptions,
    ) -> (Arc<ConnectionPool<MockConnector>>, Arc<MockConnector>) {
        let connector = Arc::new(connector);
        let pool = ConnectionPool::new(
            connector.clone(),
            Endpoint::new("mock", 11210),
            options,
            SessionOptions::default(),
        );
        (pool, connector)
    }

    fn get_packet(key: &str) -> Packet {
        Packet::from(&mut GetRequest::new(DocKey::new(key), 0))
    }

    #[tokio::test]
    async fn test_initialize_opens_min_connections() {
        let (pool, connector) = pool_with(
            MockConnector::new(Duration::from_millis(0)),
            PoolOptions::fixed(3),
        );
        pool.initialize(&CancellationToken::new()).await.unwrap();

        assert_eq!(3, pool.size());
        assert_eq!(3, connector.connect_count());
        assert!(!pool.is_disposed());
    }

    #[tokio::test]
    async fn test_initialize_retains_partial_success() {
        let (pool, connector) = pool_with(
            MockConnector::new(Duration::from_millis(0)).with_failing_connects(1),
            PoolOptions::fixed(3),
        );
        pool.initialize(&CancellationToken::new()).await.unwrap();
        assert_eq!(2, pool.size());
        assert_eq!(3, connector.connect_count());
    }

    #[tokio::test]
    async fn test_initialize_fails_only_when_empty() {
        let (pool, _connector) = pool_with(
            MockConnector::new(Duration::from_millis(0)).with_failing_connects(3),
            PoolOptions::fixed(3),
        );
        assert!(pool.initialize(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_connection_serializes_ten_ops() {
        let (pool, connector) = pool_with(
            MockConnector::new(Duration::from_millis(100)),
            PoolOptions::fixed(1),
        );
        pool.initialize(&CancellationToken::new()).await.unwrap();

        let sends = (0..10).map(|index| {
            let pool = pool.clone();
            async move {
                pool.send(get_packet(&format!("key-{}", index)), CancellationToken::new())
                    .await
            }
        });
        let results = futures::future::join_all(sends).await;

        assert!(results.iter().all(|result| result.is_ok()));
        assert_eq!(10, connector.total_served());
        assert_eq!(1, connector.max_in_flight());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_four_connections_run_in_parallel() {
        let (pool, connector) = pool_with(
            MockConnector::new(Duration::from_millis(100)),
            PoolOptions::fixed(4),
        );
        pool.initialize(&CancellationToken::new()).await.unwrap();

        let sends = (0..10).map(|index| {
            let pool = pool.clone();
            async move {
                pool.send(get_packet(&format!("key-{}", index)), CancellationToken::new())
                    .await
            }
        });
        let results = futures::future::join_all(sends).await;

        assert!(results.iter().all(|result| result.is_ok()));
        assert_eq!(4, connector.global_max_in_flight());
        assert!(connector.max_in_flight() <= 1);
    }

    #[tokio::test]
    async fn test_dead_connection_is_replaced() {
        let (pool, connector) = pool_with(
            MockConnector::new(Duration::from_millis(0)).with_dead_first(1),
            PoolOptions::fixed(1),
        );
        pool.initialize(&CancellationToken::new()).await.unwrap();
        // give the reader a moment to observe the hangup
        tokio::time::sleep(Duration::from_millis(30)).await;

        let first_ids = pool.connection_ids().await;
        let response = pool
            .send(get_packet("replace-me"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(0, response.header.vbucket_or_status);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(2, connector.connect_count());
        let ids = pool.connection_ids().await;
        assert_eq!(1, ids.len());
        assert!(ids[0] > first_ids[0]);
    }

    #[tokio::test]
    async fn test_scale_down_picks_longest_idle() {
        let (pool, _connector) = pool_with(
            MockConnector::new(Duration::from_millis(0)),
            PoolOptions::default().with_sizes(1, 5),
        );
        pool.initialize(&CancellationToken::new()).await.unwrap();
        pool.scale(2).await;
        assert_eq!(3, pool.size());

        let connections = pool.connections_for_test().await;
        connections[0].set_idle_for_test(Duration::from_secs(60));
        connections[1].set_idle_for_test(Duration::from_secs(120));
        connections[2].set_idle_for_test(Duration::from_secs(180));
        let victim = connections[2].id();

        pool.scale(-1).await;
        assert_eq!(2, pool.size());
        let remaining = pool.connection_ids().await;
        assert!(!remaining.contains(&victim));
        assert_eq!(
            vec![connections[0].id(), connections[1].id()],
            remaining
        );
    }

    #[tokio::test]
    async fn test_scale_respects_bounds() {
        let (pool, _connector) = pool_with(
            MockConnector::new(Duration::from_millis(0)),
            PoolOptions::default().with_sizes(2, 3),
        );
        pool.initialize(&CancellationToken::new()).await.unwrap();

        pool.scale(10).await;
        assert_eq!(3, pool.size());

        pool.scale(-10).await;
        assert_eq!(2, pool.size());
    }

    #[tokio::test]
    async fn test_dispose_fails_queued_and_new_sends() {
        let (pool, _connector) = pool_with(
            MockConnector::new(Duration::from_millis(0)),
            PoolOptions::fixed(1),
        );
        pool.initialize(&CancellationToken::new()).await.unwrap();
        pool.dispose().await;

        assert_eq!(0, pool.size());
        assert!(pool.is_disposed());
        let result = pool
            .send(get_packet("after-dispose"), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(crate::error::Error::PoolDisposed)));
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch() {
        let (pool, _connector) = pool_with(
            MockConnector::new(Duration::from_millis(50)),
            PoolOptions::fixed(1),
        );
        pool.initialize(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pool.send(get_packet("cancelled"), cancel).await;
        assert!(matches!(result, Err(crate::error::Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_freeze_blocks_scaling() {
        let (pool, _connector) = pool_with(
            MockConnector::new(Duration::from_millis(0)),
            PoolOptions::default().with_sizes(1, 5),
        );
        pool.initialize(&CancellationToken::new()).await.unwrap();

        let guard = pool.freeze().await;
        let scaling = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.scale(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, pool.size());

        drop(guard);
        scaling.await.unwrap();
        assert_eq!(2, pool.size());
    }
}
