use std::cmp::min;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::{Connection, EndOfStream};
use crate::error::{Result, RudpError};
use crate::timer::AbortOnDrop;

/// The read side of a connection: gathers the engine's ordered payloads into
/// a contiguous byte sequence.
///
/// Mark/reset is not supported.
pub struct RudpReader {
    connection: Arc<Connection>,
    delivery_rx: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
    eof: bool,
    _io_task: Option<Arc<AbortOnDrop>>,
}

impl RudpReader {
    pub(crate) fn new(
        connection: Arc<Connection>,
        delivery_rx: mpsc::Receiver<Vec<u8>>,
        io_task: Option<Arc<AbortOnDrop>>,
    ) -> RudpReader {
        RudpReader {
            connection,
            delivery_rx,
            current: Vec::new(),
            pos: 0,
            eof: false,
            _io_task: io_task,
        }
    }

    /// Reads at least one byte into `buf`, blocking until data is available.
    /// Returns 0 at end-of-stream after an orderly peer close, or
    /// [`RudpError::Closed`] after a reset, failure, or local input shutdown.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            if self.eof {
                return Ok(0);
            }
            match self.delivery_rx.recv().await {
                Some(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.current = chunk;
                    self.pos = 0;
                }
                None => match self.connection.end_of_stream().await {
                    EndOfStream::Orderly => {
                        self.eof = true;
                        return Ok(0);
                    }
                    EndOfStream::Error => return Err(RudpError::Closed),
                },
            }
        }

        let n = min(buf.len(), self.available());
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// The number of buffered bytes a `read` would return without blocking.
    pub fn available(&self) -> usize {
        self.current.len() - self.pos
    }

    /// Shuts down the input direction of the connection.
    pub async fn close(&mut self) {
        self.connection.shutdown_input().await;
    }
}

/// The write side of a connection: buffers user writes and chunks them into
/// MSS-sized data segments on flush.
pub struct RudpWriter {
    connection: Arc<Connection>,
    buf: Vec<u8>,
    capacity: usize,
    max_payload: usize,
    _io_task: Option<Arc<AbortOnDrop>>,
}

impl RudpWriter {
    pub(crate) fn new(
        connection: Arc<Connection>,
        capacity: usize,
        max_payload: usize,
        io_task: Option<Arc<AbortOnDrop>>,
    ) -> RudpWriter {
        RudpWriter {
            connection,
            buf: Vec::with_capacity(capacity),
            capacity,
            max_payload,
            _io_task: io_task,
        }
    }

    /// Copies `data` into the send buffer, flushing to the engine whenever
    /// the buffer fills. Blocks while the peer's window keeps the engine from
    /// accepting more segments.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = self.capacity - self.buf.len();
            let n = min(room, data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];

            if self.buf.len() == self.capacity {
                self.flush().await?;
            }
        }
        Ok(())
    }

    /// Hands all buffered bytes to the engine for segmentation and transmission.
    pub async fn flush(&mut self) -> Result<()> {
        for chunk in self.buf.chunks(self.max_payload) {
            self.connection.send_data(chunk).await?;
        }
        self.buf.clear();
        Ok(())
    }

    /// Flushes pending bytes and shuts down the output direction of the
    /// connection.
    pub async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        self.connection.shutdown_output().await
    }
}
