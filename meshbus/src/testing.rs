//! Helpers shared by the in-crate tests.

use std::sync::Arc;
use std::time::Duration;

use crate::config::BusConfig;
use crate::connection::Connection;
use crate::driver::MemoryBroker;

pub(crate) const MEMORY_URL: &str = "memory://test";

/// A connected session over a fresh in-process broker
pub(crate) async fn memory_connection(config: BusConfig) -> (Arc<Connection>, MemoryBroker) {
    let broker = MemoryBroker::new();
    let connection = Arc::new(Connection::new(Arc::new(broker.clone()), config));
    connection.connect(MEMORY_URL).await.unwrap();
    (connection, broker)
}

/// Poll `condition` until it holds, panicking after two seconds
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
