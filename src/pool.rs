// ABOUTME: Bounded pool of TCP connections shared by pooled client callers
// ABOUTME: Eagerly fills to minsize, lazily grows to maxsize, recycles only healthy connections

use crate::connection::{Connection, Transport};
use crate::error::RpcResult;
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

/// A connection on loan from the pool. Callers mark it [`poison`] on any
/// I/O failure so [`ConnectionPool::release`] doesn't hand a dead socket
/// to the next caller — the Rust analogue of the original's
/// `conn.reader.set_exception(exc)`.
pub struct PooledConnection {
    pub conn: Connection<Transport>,
    healthy: bool,
}

impl PooledConnection {
    /// Record that this connection should not be reused.
    pub fn poison(&mut self) {
        self.healthy = false;
    }
}

struct Inner {
    idle: VecDeque<PooledConnection>,
    size: usize,
}

/// A bounded pool of connections to one TCP address.
///
/// `minsize` connections are opened eagerly the first time `acquire` is
/// called; the pool grows on demand up to `maxsize` and blocks past
/// that until a connection is released.
pub struct ConnectionPool {
    addr: String,
    minsize: usize,
    maxsize: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl ConnectionPool {
    pub fn new(addr: impl Into<String>, minsize: usize, maxsize: usize) -> Self {
        ConnectionPool {
            addr: addr.into(),
            minsize,
            maxsize,
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                size: 0,
            }),
            notify: Notify::new(),
        }
    }

    async fn open(&self) -> RpcResult<Connection<Transport>> {
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(Connection::from_tcp(stream)?)
    }

    /// Try to open one more connection, respecting `maxsize`. Returns
    /// `Ok(None)` when the pool is already at capacity, never an error
    /// for that case — only a genuine connect failure is an `Err`.
    async fn try_create(&self, inner: &mut Inner) -> RpcResult<Option<PooledConnection>> {
        if inner.size >= self.maxsize {
            return Ok(None);
        }
        inner.size += 1;
        match self.open().await {
            Ok(conn) => Ok(Some(PooledConnection { conn, healthy: true })),
            Err(e) => {
                inner.size -= 1;
                Err(e)
            }
        }
    }

    /// Borrow a healthy connection, opening a new one if the idle queue
    /// is empty and the pool has room, or waiting for a release otherwise.
    pub async fn acquire(&self) -> RpcResult<PooledConnection> {
        {
            let mut inner = self.inner.lock().await;
            while inner.size < self.minsize {
                match self.try_create(&mut inner).await {
                    Ok(Some(pooled)) => inner.idle.push_back(pooled),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }

        loop {
            let mut inner = self.inner.lock().await;
            while let Some(pooled) = inner.idle.pop_front() {
                if pooled.healthy && !pooled.conn.is_closed() {
                    return Ok(pooled);
                }
                inner.size -= 1;
            }

            match self.try_create(&mut inner).await? {
                Some(pooled) => return Ok(pooled),
                None => {
                    drop(inner);
                    self.notify.notified().await;
                }
            }
        }
    }

    /// Return a connection to the pool, or discard it if it was marked
    /// unhealthy or is already closed.
    pub async fn release(&self, pooled: PooledConnection) {
        let mut inner = self.inner.lock().await;
        if pooled.healthy && !pooled.conn.is_closed() {
            inner.idle.push_back(pooled);
        } else {
            inner.size -= 1;
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Close every idle connection and reset the pool to empty.
    /// Connections currently on loan are unaffected; releasing them
    /// afterward simply drops them since they're already unaccounted for.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        while let Some(mut pooled) = inner.idle.pop_front() {
            pooled.conn.close().await;
            inner.size -= 1;
        }
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.size
    }
}
