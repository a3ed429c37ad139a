//! Read and write access to the ledger the dispute is enforced on.

use crate::protocol::transaction::Transaction;
use crate::types::encoding::DecodeError;
use crate::types::hash::Hash;
use crate::warn;
use async_trait::async_trait;
use bitdispute_derive::Error;
use std::io;
use std::time::Duration;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("indexer unreachable: {0}")]
    Io(io::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("malformed indexer response: {0}")]
    Decode(DecodeError),
}

impl IndexerError {
    /// Failures worth retrying: the request may succeed unchanged later.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexerError::Io(_))
    }
}

impl From<io::Error> for IndexerError {
    fn from(err: io::Error) -> Self {
        IndexerError::Io(err)
    }
}

impl From<DecodeError> for IndexerError {
    fn from(err: DecodeError) -> Self {
        IndexerError::Decode(err)
    }
}

/// Chain indexer and broadcaster.
#[async_trait]
pub trait ChainIndexer: Send + Sync {
    async fn latest_height(&self) -> Result<u64, IndexerError>;

    /// Hash of the block at `height`.
    async fn block_at(&self, height: u64) -> Result<Hash, IndexerError>;

    /// Transactions of a block, in block order.
    async fn block_txids(&self, block: &Hash) -> Result<Vec<Hash>, IndexerError>;

    /// A confirmed transaction, witness included.
    async fn transaction(&self, txid: &Hash) -> Result<Transaction, IndexerError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Hash, IndexerError>;
}

/// Retries transient failures of an inner indexer with exponential back-off.
pub struct RetryingIndexer<I> {
    inner: I,
    attempts: u32,
    base_delay: Duration,
}

impl<I: ChainIndexer> RetryingIndexer<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }

    pub fn with_backoff(inner: I, attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }

    async fn retry<'a, T, F, Fut>(&'a self, what: &str, mut call: F) -> Result<T, IndexerError>
    where
        F: FnMut(&'a I) -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match call(&self.inner).await {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    warn!(
                        "{what} failed (attempt {attempt}/{}): {err}; retrying in {}ms",
                        self.attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl<I: ChainIndexer> ChainIndexer for RetryingIndexer<I> {
    async fn latest_height(&self) -> Result<u64, IndexerError> {
        self.retry("latest_height", |i| i.latest_height()).await
    }

    async fn block_at(&self, height: u64) -> Result<Hash, IndexerError> {
        self.retry("block_at", move |i| i.block_at(height)).await
    }

    async fn block_txids(&self, block: &Hash) -> Result<Vec<Hash>, IndexerError> {
        self.retry("block_txids", move |i| i.block_txids(block)).await
    }

    async fn transaction(&self, txid: &Hash) -> Result<Transaction, IndexerError> {
        self.retry("transaction", move |i| i.transaction(txid)).await
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Hash, IndexerError> {
        self.retry("broadcast", move |i| i.broadcast(tx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with a transient error until `failures` calls have been made.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChainIndexer for Flaky {
        async fn latest_height(&self) -> Result<u64, IndexerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
            }
            Ok(7)
        }

        async fn block_at(&self, height: u64) -> Result<Hash, IndexerError> {
            Err(IndexerError::NotFound(format!("block {height}")))
        }

        async fn block_txids(&self, _block: &Hash) -> Result<Vec<Hash>, IndexerError> {
            Ok(Vec::new())
        }

        async fn transaction(&self, txid: &Hash) -> Result<Transaction, IndexerError> {
            Err(IndexerError::NotFound(format!("transaction {txid}")))
        }

        async fn broadcast(&self, _tx: &Transaction) -> Result<Hash, IndexerError> {
            Err(IndexerError::Rejected("read-only".into()))
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let indexer = RetryingIndexer::with_backoff(flaky(2), 5, Duration::from_millis(1));
        assert_eq!(indexer.latest_height().await.unwrap(), 7);
        assert_eq!(indexer.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let indexer = RetryingIndexer::with_backoff(flaky(10), 3, Duration::from_millis(1));
        let err = indexer.latest_height().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(indexer.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let indexer = RetryingIndexer::with_backoff(flaky(0), 5, Duration::from_millis(1));
        assert!(matches!(
            indexer.block_at(3).await,
            Err(IndexerError::NotFound(_))
        ));
    }
}
