//! The byte pump
//!
//! One source, any number of tagged sinks. Fan-out happens inside one
//! chunk boundary by sequential writes, so every surviving sink sees a
//! prefix of the exact same byte stream. A failing sink is detached
//! and reported as a warning; the run only aborts when the set
//! empties. Cancellation is a shared flag checked between chunks.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::BufferSizer;
use crate::error::{Error, Result};

/// Cooperative cancellation flag, checked at every chunk boundary.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancel)
        } else {
            Ok(())
        }
    }
}

/// Byte-level progress and per-peer failure callbacks.
pub trait TransferListener: Send + Sync {
    fn progress(&self, _transferred: u64, _total: u64) {}
    fn peer_failed(&self, _peer: &str, _msg: &str) {}
}

pub struct NoopListener;
impl TransferListener for NoopListener {}

struct TaggedSink {
    peer: String,
    writer: Box<dyn Write + Send>,
}

/// The transfer hub. Constructed and owned by the orchestrator; there
/// is exactly one per running operation.
pub struct TransferHub {
    source: Option<Box<dyn Read + Send>>,
    sinks: Mutex<Vec<TaggedSink>>,
    total: AtomicU64,
    transferred: AtomicU64,
    chunk_size: usize,
    cancel: CancelToken,
    listener: Arc<dyn TransferListener>,
}

impl TransferHub {
    pub fn new(cancel: CancelToken, listener: Arc<dyn TransferListener>) -> Self {
        TransferHub {
            source: None,
            sinks: Mutex::new(Vec::new()),
            total: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            chunk_size: BufferSizer::new().chunk_size(0, false),
            cancel,
            listener,
        }
    }

    pub fn set_source(&mut self, source: Box<dyn Read + Send>) {
        self.source = Some(source);
    }

    pub fn add_sink(&self, peer: impl Into<String>, writer: Box<dyn Write + Send>) {
        self.sinks.lock().push(TaggedSink {
            peer: peer.into(),
            writer,
        });
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Total size in bytes, known before the payload starts. Also
    /// recomputes the chunk size for the transfer.
    pub fn set_total(&mut self, total: u64, is_network: bool) {
        self.total.store(total, Ordering::SeqCst);
        self.chunk_size = BufferSizer::new().chunk_size(total, is_network);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    fn count(&self, n: u64) {
        let done = self.transferred.fetch_add(n, Ordering::SeqCst) + n;
        self.listener.progress(done, self.total());
    }

    /// Account for control bytes (header, descriptors, size prefixes)
    /// moved outside the counted pump loops, keeping the progress
    /// counter aligned with the declared total.
    pub fn note_consumed(&self, n: u64) {
        self.count(n);
    }

    /// Push one buffer to every sink and to nothing else. Used for the
    /// header block and the size prelude; does not advance progress.
    pub fn transfer_from(&self, buf: &[u8]) -> Result<()> {
        self.push_chunk(buf)
    }

    /// Pull exactly `buf.len()` bytes from the source. Used for the
    /// header block and the size prelude; does not advance progress.
    /// Like every source read, the bytes are relayed to any sinks.
    pub fn transfer_to(&mut self, buf: &mut [u8]) -> Result<()> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| Error::ReceiveData("no source descriptor".into()))?;
        source
            .read_exact(buf)
            .map_err(|e| Error::ReceiveData(e.to_string()))?;
        self.forward_to_sinks(buf);
        Ok(())
    }

    /// Stream `fd` to every sink until EOF. Returns bytes moved.
    pub fn transfer_all_from(&mut self, fd: &mut dyn Read) -> Result<u64> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut moved = 0u64;
        loop {
            self.cancel.check()?;
            let n = fd
                .read(&mut buf)
                .map_err(|e| Error::ReadData(e.to_string()))?;
            if n == 0 {
                break;
            }
            self.push_chunk(&buf[..n])?;
            moved += n as u64;
            self.count(n as u64);
        }
        Ok(moved)
    }

    /// Stream the source to `fd` until `transferred == total`.
    pub fn transfer_all_to(&mut self, fd: &mut dyn Write) -> Result<u64> {
        let total = self.total();
        let mut buf = vec![0u8; self.chunk_size];
        let mut moved = 0u64;
        while self.transferred() < total {
            self.cancel.check()?;
            let want = (total - self.transferred()).min(buf.len() as u64) as usize;
            let source = self
                .source
                .as_mut()
                .ok_or_else(|| Error::ReceiveData("no source descriptor".into()))?;
            let n = source
                .read(&mut buf[..want])
                .map_err(|e| Error::ReceiveData(e.to_string()))?;
            if n == 0 {
                return Err(Error::InvalidImage("stream truncated before total size"));
            }
            fd.write_all(&buf[..n])
                .map_err(|e| Error::WriteData(e.to_string()))?;
            self.forward_to_sinks(&buf[..n]);
            moved += n as u64;
            self.count(n as u64);
        }
        Ok(moved)
    }

    /// A bounded reader over the source that advances the progress
    /// counter, for consumers that parse the stream (archive reader).
    pub fn source_reader(&mut self, len: u64) -> HubReader<'_> {
        HubReader {
            hub: self,
            remaining: len,
        }
    }

    /// Sequential fan-out of one chunk. A sink that fails to take the
    /// whole chunk is detached; the transfer aborts only when no sink
    /// remains.
    fn push_chunk(&self, chunk: &[u8]) -> Result<()> {
        let mut sinks = self.sinks.lock();
        if sinks.is_empty() {
            return Err(Error::SendData("sink set is empty".into()));
        }
        let mut failed: Vec<usize> = Vec::new();
        for (i, sink) in sinks.iter_mut().enumerate() {
            if let Err(e) = sink.writer.write_all(chunk) {
                self.listener.peer_failed(&sink.peer, &e.to_string());
                failed.push(i);
            }
        }
        for i in failed.into_iter().rev() {
            sinks.remove(i);
        }
        if sinks.is_empty() {
            return Err(Error::SendData("all receivers lost".into()));
        }
        Ok(())
    }

    /// Relay a chunk read from the source to downstream sinks. Unlike
    /// [`push_chunk`](Self::push_chunk) this tolerates an empty set:
    /// the local destination is the primary consumer, a lost relay
    /// only starves nodes further down the chain.
    fn forward_to_sinks(&self, chunk: &[u8]) {
        let mut sinks = self.sinks.lock();
        let mut failed: Vec<usize> = Vec::new();
        for (i, sink) in sinks.iter_mut().enumerate() {
            if let Err(e) = sink.writer.write_all(chunk) {
                self.listener.peer_failed(&sink.peer, &e.to_string());
                failed.push(i);
            }
        }
        for i in failed.into_iter().rev() {
            sinks.remove(i);
        }
    }

    /// Flush every sink; failures here are terminal for the peer too.
    pub fn flush_sinks(&self) -> Result<()> {
        let mut sinks = self.sinks.lock();
        let mut failed: Vec<usize> = Vec::new();
        for (i, sink) in sinks.iter_mut().enumerate() {
            if let Err(e) = sink.writer.flush() {
                self.listener.peer_failed(&sink.peer, &e.to_string());
                failed.push(i);
            }
        }
        for i in failed.into_iter().rev() {
            sinks.remove(i);
        }
        Ok(())
    }

    /// Drop every descriptor the hub owns. Runs on every termination
    /// path via the orchestrator's shutdown handler.
    pub fn close(&mut self) {
        self.source = None;
        self.sinks.lock().clear();
    }
}

/// Bounded, progress-counting reader over the hub source.
pub struct HubReader<'a> {
    hub: &'a mut TransferHub,
    remaining: u64,
}

impl Read for HubReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        if self.hub.cancel.is_cancelled() {
            return Err(std::io::Error::other(Error::Cancel));
        }
        let want = (self.remaining.min(buf.len() as u64)) as usize;
        let source = self
            .hub
            .source
            .as_mut()
            .ok_or_else(|| std::io::Error::other("no source descriptor"))?;
        let n = source.read(&mut buf[..want])?;
        self.remaining -= n as u64;
        self.hub.forward_to_sinks(&buf[..n]);
        self.hub.count(n as u64);
        Ok(n)
    }
}
