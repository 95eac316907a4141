//! Test support: pool + router pairs on a memory network

use crate::events::EventBus;
use crate::network::memory::MemoryNetwork;
use crate::network::message::{PeerDescriptor, PeerId};
use crate::network::node::spawn_event_pump;
use crate::network::pool::{ConnectionPool, PoolConfig};
use crate::network::router::MessageRouter;
use crate::network::transport::Transport;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) struct TestPeer {
    pub pool: Arc<ConnectionPool>,
    pub router: Arc<MessageRouter>,
    pub events: Arc<EventBus>,
}

impl TestPeer {
    pub fn id(&self) -> PeerId {
        self.pool.local().peer_id
    }
}

/// A peer listening on `port`, with its transport events pumped into the
/// pool and router
pub(crate) async fn test_peer(network: &MemoryNetwork, port: u16) -> TestPeer {
    let (tx, rx) = mpsc::channel(256);
    let transport = Arc::new(network.endpoint(tx));
    transport.listen(port).await.unwrap();

    let events = Arc::new(EventBus::new());
    let local = PeerDescriptor::new(PeerId::new(), "127.0.0.1", port, format!("node-{}", port));
    let config = PoolConfig {
        handshake_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(1),
        retry_attempts: 1,
        retry_delay: Duration::from_millis(10),
    };
    let pool = Arc::new(ConnectionPool::new(local, transport, config, events.clone()));
    let router = Arc::new(MessageRouter::new(pool.clone()));

    spawn_event_pump(router.clone(), rx);

    TestPeer {
        pool,
        router,
        events,
    }
}

/// Connect `a` to `b` and wait until both sides see the link
pub(crate) async fn link(a: &TestPeer, b: &TestPeer) {
    let local = b.pool.local().clone();
    a.pool.connect(&local.ip, local.puerto).await.unwrap();

    let a_id = a.id();
    let b_pool = b.pool.clone();
    wait_until(move || {
        let b_pool = b_pool.clone();
        async move { b_pool.is_connected(&a_id).await }
    })
    .await;
}

/// Poll `check` until it holds, panicking after two seconds
pub(crate) async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
