//! Flush destinations.
//!
//! The device never opens files itself. It is handed a [`SinkOpener`] at
//! construction and asks it for a [`Sink`] at `start`, using the configured
//! destination path. The sink lives behind the flush lock until `stop`
//! closes it.
//!
//! Two openers are provided:
//!
//! - [`FileSinkOpener`]: a file (or device node) opened through `tokio::fs`
//! - [`MemorySinkOpener`]: an in-memory buffer with failure injection, for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

/// An open flush destination.
#[async_trait]
pub trait Sink: Send {
    /// Write some prefix of `data`, returning how many bytes were taken.
    async fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Push written bytes to durable storage.
    async fn sync(&mut self) -> io::Result<()>;

    /// Release the destination.
    async fn close(self: Box<Self>) -> io::Result<()>;
}

/// Opens a [`Sink`] for a destination path.
#[async_trait]
pub trait SinkOpener: Send + Sync {
    /// Open `path` for writing.
    async fn open(&self, path: &str) -> io::Result<Box<dyn Sink>>;
}

// =============================================================================
// File sink
// =============================================================================

/// Opens destinations through `tokio::fs`.
///
/// The default opens an existing path write-only, which suits device nodes
/// and FIFOs. Regular files usually want [`create`](Self::create) plus either
/// [`truncate`](Self::truncate) or [`append`](Self::append).
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSinkOpener {
    create: bool,
    truncate: bool,
    append: bool,
}

impl FileSinkOpener {
    /// Write-only, no create, no truncate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the file if it does not exist.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Empty the file on open. Ignored in append mode.
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Append to the end of the file instead of writing from the start.
    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

#[async_trait]
impl SinkOpener for FileSinkOpener {
    async fn open(&self, path: &str) -> io::Result<Box<dyn Sink>> {
        let mut options = OpenOptions::new();
        options.write(true).create(self.create);
        if self.append {
            options.append(true);
        } else {
            options.truncate(self.truncate);
        }

        let file = options.open(path).await?;
        debug!(path, append = self.append, "Opened file sink");
        Ok(Box::new(FileSink { file }))
    }
}

struct FileSink {
    file: File,
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file.write(data).await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        match self.file.sync_data().await {
            // Device nodes and pipes cannot be synced
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    async fn close(mut self: Box<Self>) -> io::Result<()> {
        self.file.flush().await
    }
}

// =============================================================================
// Memory sink
// =============================================================================

#[derive(Debug, Default)]
struct MemoryBehavior {
    fail_open: bool,
    fail_writes: bool,
    max_write: Option<usize>,
    stall_writes: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    contents: Mutex<Vec<u8>>,
    writes: Mutex<Vec<usize>>,
    opened: Mutex<Vec<String>>,
    behavior: Mutex<MemoryBehavior>,
    syncs: AtomicUsize,
    closes: AtomicUsize,
}

/// In-memory sink opener with inspectable contents and injectable faults.
///
/// Clones share state, so a test keeps one handle and gives another to the
/// device.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkOpener {
    state: Arc<MemoryState>,
}

impl MemorySinkOpener {
    /// Empty store that accepts every write.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `open` fail with `PermissionDenied`.
    pub fn fail_open(&self, fail: bool) {
        self.state.behavior.lock().fail_open = fail;
    }

    /// Make every subsequent write fail with `BrokenPipe`.
    pub fn fail_writes(&self, fail: bool) {
        self.state.behavior.lock().fail_writes = fail;
    }

    /// Accept at most `limit` bytes per write call.
    pub fn limit_writes(&self, limit: Option<usize>) {
        self.state.behavior.lock().max_write = limit;
    }

    /// Make writes hang forever.
    pub fn stall_writes(&self, stall: bool) {
        self.state.behavior.lock().stall_writes = stall;
    }

    /// Everything written so far, across all opens.
    pub fn contents(&self) -> Vec<u8> {
        self.state.contents.lock().clone()
    }

    /// Size of each successful write call, in order.
    pub fn write_sizes(&self) -> Vec<usize> {
        self.state.writes.lock().clone()
    }

    /// Paths passed to `open`, in order.
    pub fn opened_paths(&self) -> Vec<String> {
        self.state.opened.lock().clone()
    }

    /// Number of `sync` calls.
    pub fn sync_count(&self) -> usize {
        self.state.syncs.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SinkOpener for MemorySinkOpener {
    async fn open(&self, path: &str) -> io::Result<Box<dyn Sink>> {
        if self.state.behavior.lock().fail_open {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "memory sink configured to refuse open",
            ));
        }
        self.state.opened.lock().push(path.to_string());
        Ok(Box::new(MemorySink {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemorySink {
    state: Arc<MemoryState>,
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let (fail, stall, limit) = {
            let behavior = self.state.behavior.lock();
            (behavior.fail_writes, behavior.stall_writes, behavior.max_write)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"));
        }

        let n = limit.map_or(data.len(), |limit| limit.min(data.len()));
        self.state.contents.lock().extend_from_slice(&data[..n]);
        self.state.writes.lock().push(n);
        trace!(requested = data.len(), written = n, "Memory sink write");
        Ok(n)
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.state.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
