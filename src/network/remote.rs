//! Ledger access over TCP.
//!
//! [`ChainServer`] serves a [`LocalChain`]; [`RemoteIndexer`] is the client
//! side of [`ChainIndexer`]. Requests and responses are `BinaryCodec`
//! values in length-prefixed frames:
//!
//! ```text
//! [len: u32 LE][payload: len bytes]
//! ```
//!
//! One request is answered by exactly one response on the same connection.

use crate::network::indexer::{ChainIndexer, IndexerError};
use crate::network::local_chain::LocalChain;
use crate::protocol::transaction::Transaction;
use crate::types::encoding::{Decode, Encode};
use crate::types::hash::Hash;
use crate::{debug, info, warn};
use async_trait::async_trait;
use bitdispute_derive::BinaryCodec;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub enum Request {
    LatestHeight,
    BlockAt(u64),
    BlockTxids(Hash),
    Transaction(Hash),
    Broadcast(Transaction),
    /// Faucet: confirm a funding transaction without a witness.
    Fund(Transaction),
}

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub enum Response {
    Height(u64),
    Block(Hash),
    Txids(Vec<Hash>),
    Transaction(Transaction),
    Txid(Hash),
    NotFound(String),
    Rejected(String),
}

async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    let len = (data.len() as u32).to_le_bytes();
    stream.write_all(&len).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame length"));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

/// Serves a [`LocalChain`] to remote parties.
pub struct ChainServer {
    chain: Arc<LocalChain>,
    listener: TcpListener,
}

impl ChainServer {
    pub async fn bind(address: SocketAddr, chain: Arc<LocalChain>) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { chain, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the task is dropped.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Ledger client connected from {peer}");
                    let chain = self.chain.clone();
                    tokio::spawn(async move {
                        Self::handle(chain, stream).await;
                        debug!("Ledger client {peer} disconnected");
                    });
                }
                Err(err) => warn!("Failed to accept a ledger client: {err}"),
            }
        }
    }

    async fn handle(chain: Arc<LocalChain>, mut stream: TcpStream) {
        loop {
            let Ok(frame) = read_frame(&mut stream).await else {
                return;
            };
            let response = match Request::from_bytes(&frame) {
                Ok(request) => Self::dispatch(&chain, request).await,
                Err(err) => Response::Rejected(format!("malformed request: {err}")),
            };
            if write_frame(&mut stream, &response.to_bytes()).await.is_err() {
                return;
            }
        }
    }

    async fn dispatch(chain: &LocalChain, request: Request) -> Response {
        let result = match request {
            Request::LatestHeight => chain.latest_height().await.map(Response::Height),
            Request::BlockAt(height) => chain.block_at(height).await.map(Response::Block),
            Request::BlockTxids(block) => chain.block_txids(&block).await.map(Response::Txids),
            Request::Transaction(txid) => {
                chain.transaction(&txid).await.map(Response::Transaction)
            }
            Request::Broadcast(tx) => chain.broadcast(&tx).await.map(Response::Txid),
            Request::Fund(tx) => {
                info!("Faucet request for {}", tx.txid());
                Ok(Response::Txid(chain.fund(&tx).await))
            }
        };
        match result {
            Ok(response) => response,
            Err(IndexerError::NotFound(what)) => Response::NotFound(what),
            Err(err) => Response::Rejected(err.to_string()),
        }
    }
}

/// [`ChainIndexer`] backed by a [`ChainServer`].
pub struct RemoteIndexer {
    address: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
}

impl RemoteIndexer {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            stream: Mutex::new(None),
        }
    }

    /// Sends one request, reconnecting if the previous connection broke.
    async fn call(&self, request: Request) -> Result<Response, IndexerError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(TcpStream::connect(self.address).await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        };

        let exchange = async {
            write_frame(stream, &request.to_bytes()).await?;
            read_frame(stream).await
        };
        let frame = match exchange.await {
            Ok(frame) => frame,
            Err(err) => {
                *guard = None;
                return Err(err.into());
            }
        };
        match Response::from_bytes(&frame)? {
            Response::NotFound(what) => Err(IndexerError::NotFound(what)),
            Response::Rejected(reason) => Err(IndexerError::Rejected(reason)),
            response => Ok(response),
        }
    }

    /// Asks the server's faucet to confirm a funding transaction.
    pub async fn fund(&self, tx: &Transaction) -> Result<Hash, IndexerError> {
        match self.call(Request::Fund(tx.clone())).await? {
            Response::Txid(txid) => Ok(txid),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> IndexerError {
    IndexerError::Rejected(format!("unexpected response {response:?}"))
}

#[async_trait]
impl ChainIndexer for RemoteIndexer {
    async fn latest_height(&self) -> Result<u64, IndexerError> {
        match self.call(Request::LatestHeight).await? {
            Response::Height(height) => Ok(height),
            other => Err(unexpected(other)),
        }
    }

    async fn block_at(&self, height: u64) -> Result<Hash, IndexerError> {
        match self.call(Request::BlockAt(height)).await? {
            Response::Block(hash) => Ok(hash),
            other => Err(unexpected(other)),
        }
    }

    async fn block_txids(&self, block: &Hash) -> Result<Vec<Hash>, IndexerError> {
        match self.call(Request::BlockTxids(*block)).await? {
            Response::Txids(txids) => Ok(txids),
            other => Err(unexpected(other)),
        }
    }

    async fn transaction(&self, txid: &Hash) -> Result<Transaction, IndexerError> {
        match self.call(Request::Transaction(*txid)).await? {
            Response::Transaction(tx) => Ok(tx),
            other => Err(unexpected(other)),
        }
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Hash, IndexerError> {
        match self.call(Request::Broadcast(tx.clone())).await? {
            Response::Txid(txid) => Ok(txid),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transaction::{Outpoint, TxOut};

    fn faucet_tx(value: u64) -> Transaction {
        Transaction {
            input: Outpoint {
                txid: Hash::digest(b"setup"),
                vout: u32::MAX,
            },
            sequence: 0,
            output: TxOut {
                value,
                commitment: Hash::digest(b"anyone"),
            },
            witness: None,
        }
    }

    async fn serve() -> (Arc<LocalChain>, RemoteIndexer) {
        let chain = Arc::new(LocalChain::new());
        let server = ChainServer::bind("127.0.0.1:0".parse().unwrap(), chain.clone())
            .await
            .unwrap();
        let address = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        (chain, RemoteIndexer::new(address))
    }

    #[tokio::test]
    async fn remote_reads_the_served_chain() {
        let (chain, remote) = serve().await;
        assert_eq!(remote.latest_height().await.unwrap(), 0);

        let tx = faucet_tx(1_000);
        let txid = remote.fund(&tx).await.unwrap();
        chain.mine().await;

        assert_eq!(remote.latest_height().await.unwrap(), 1);
        let block = remote.block_at(1).await.unwrap();
        assert_eq!(remote.block_txids(&block).await.unwrap(), vec![txid]);
        assert_eq!(remote.transaction(&txid).await.unwrap(), tx);
    }

    #[tokio::test]
    async fn errors_cross_the_wire() {
        let (_chain, remote) = serve().await;
        assert!(matches!(
            remote.block_at(5).await,
            Err(IndexerError::NotFound(_))
        ));
        // A funding transaction has no witness, so it cannot be broadcast.
        assert!(matches!(
            remote.broadcast(&faucet_tx(1)).await,
            Err(IndexerError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        let err = RemoteIndexer::new(address).latest_height().await.unwrap_err();
        assert!(err.is_transient());
    }
}
