//! Size- and time-triggered output buffering between the interpreter and the peer.

use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    config::SinkConfig,
    progress::{OutputChunk, OutputStream, ProgressEvent, ProgressSender},
};

/// Sink error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("Output sink is closed")]
    Closed,
    #[error("Output receiver is gone")]
    Disconnected,
}

impl From<SinkError> for io::Error {
    fn from(e: SinkError) -> Self {
        let kind = match e {
            SinkError::Closed => io::ErrorKind::BrokenPipe,
            SinkError::Disconnected => io::ErrorKind::NotConnected,
        };
        Self::new(kind, e)
    }
}

struct Inner {
    stream: OutputStream,
    capacity: usize,
    buffer: Mutex<Vec<u8>>,
    target: Mutex<Option<ProgressSender>>,
    closed: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn deliver(&self, data: Vec<u8>) -> Result<(), SinkError> {
        let target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = target.as_ref().ok_or(SinkError::Closed)?;
        sender
            .send(ProgressEvent::output(OutputChunk {
                stream: self.stream,
                data: Bytes::from(data),
            }))
            .map_err(|_| SinkError::Disconnected)
    }

    fn flush(&self) -> Result<(), SinkError> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut *buffer);
        // Deliver under the buffer lock so concurrent flushes keep byte order.
        self.deliver(data)
    }
}

/// Buffered writer that forwards interpreter output as progress events.
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone)]
pub struct BufferedSink {
    inner: Arc<Inner>,
}

impl BufferedSink {
    /// Create a sink delivering to `target`. No periodic flushing until
    /// [`Self::start_periodic_flush`] is called.
    #[must_use]
    pub fn new(stream: OutputStream, capacity: usize, target: ProgressSender) -> Self {
        Self {
            inner: Arc::new(Inner {
                stream,
                capacity: capacity.max(1),
                buffer: Mutex::new(Vec::with_capacity(capacity.min(8 * 1024))),
                target: Mutex::new(Some(target)),
                closed: AtomicBool::new(false),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Create a sink from configuration and start its periodic flush timer.
    #[must_use]
    pub fn with_config(stream: OutputStream, config: &SinkConfig, target: ProgressSender) -> Self {
        let sink = Self::new(stream, config.capacity, target);
        sink.start_periodic_flush(config.flush_interval);
        sink
    }

    /// Which stream this sink carries.
    #[must_use]
    pub fn stream(&self) -> OutputStream {
        self.inner.stream
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Append `data`.
    ///
    /// A write at least as large as the capacity flushes what is buffered and
    /// is then delivered on its own. Otherwise the buffer is flushed once it
    /// grows past the capacity.
    ///
    /// # Errors
    /// Returns [`SinkError::Closed`] after close, or
    /// [`SinkError::Disconnected`] if the receiver is gone.
    pub fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut buffer = self
            .inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if data.len() >= self.inner.capacity {
            if !buffer.is_empty() {
                let pending = std::mem::take(&mut *buffer);
                self.inner.deliver(pending)?;
            }
            return self.inner.deliver(data.to_vec());
        }

        buffer.extend_from_slice(data);
        if buffer.len() > self.inner.capacity {
            let pending = std::mem::take(&mut *buffer);
            return self.inner.deliver(pending);
        }
        Ok(())
    }

    /// Deliver everything buffered.
    ///
    /// # Errors
    /// Returns [`SinkError::Disconnected`] if the receiver is gone.
    pub fn flush(&self) -> Result<(), SinkError> {
        self.inner.flush()
    }

    /// Flush every `period` on the current Tokio runtime until closed.
    ///
    /// Does nothing outside a runtime or if a timer is already running.
    pub fn start_periodic_flush(&self, period: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(stream = ?self.inner.stream, "No runtime, periodic flush disabled");
            return;
        };

        let mut timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() || self.is_closed() {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *timer = Some(handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = inner.flush() {
                    tracing::trace!(stream = ?inner.stream, "Periodic flush failed: {e}");
                }
            }
        }));
    }

    /// Final flush, stop the timer and release the receiver. Safe to repeat.
    ///
    /// # Errors
    /// Returns the final flush's error, if any.
    pub fn close(&self) -> Result<(), SinkError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self.inner.flush();
        if let Some(timer) = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
        self.inner
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        result
    }
}

impl io::Write for BufferedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        BufferedSink::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        BufferedSink::flush(self).map_err(io::Error::from)
    }
}

impl std::fmt::Debug for BufferedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedSink")
            .field("stream", &self.inner.stream)
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
