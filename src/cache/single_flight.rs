//! Single-flight coalescing for cache operations.
//!
//! Concurrent callers of the same operation on the same key share one
//! underlying execution. The leader runs in a detached task, so a caller
//! that stops waiting never cancels the work for the remaining callers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{Cache, CacheError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Get,
    Set,
    Delete,
}

type Flight = Result<Vec<u8>, CacheError>;
type FlightMap = Mutex<HashMap<(Op, String), broadcast::Sender<Flight>>>;

pub struct SingleFlightCache<C> {
    inner: Arc<C>,
    flights: Arc<FlightMap>,
}

impl<C: Cache + 'static> SingleFlightCache<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner: Arc::new(inner),
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn join(&self, op: Op, key: &str, entry: Option<Vec<u8>>) -> Flight {
        let flight_key = (op, key.to_string());

        let mut rx = {
            let mut flights = self.flights.lock();

            match flights.get(&flight_key) {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    flights.insert(flight_key.clone(), tx.clone());

                    let inner = Arc::clone(&self.inner);
                    let flights = Arc::clone(&self.flights);
                    let key = key.to_string();

                    tokio::spawn(async move {
                        let result = match op {
                            Op::Get => inner.get(&key).await,
                            Op::Set => {
                                let entry = entry.unwrap_or_default();
                                inner.set(&key, &entry).await.map(|()| entry)
                            }
                            Op::Delete => inner.delete(&key).await,
                        };

                        // Unregister before publishing so late callers start
                        // a fresh flight instead of subscribing to a closed
                        // channel.
                        flights.lock().remove(&flight_key);
                        let _ = tx.send(result);
                    });

                    rx
                }
            }
        };

        match rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Other("coalesced operation aborted".to_string())),
        }
    }
}

#[async_trait]
impl<C: Cache + 'static> Cache for SingleFlightCache<C> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn set(&self, key: &str, entry: &[u8]) -> Result<(), CacheError> {
        self.join(Op::Set, key, Some(entry.to_vec())).await.map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self.join(Op::Delete, key, None).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self.join(Op::Get, key, None).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
