//! Micro-batching buffer between the SSE parser and the token channel.
//!
//! High-frequency token fragments are coalesced so the orchestrator (and
//! the card service behind it) sees at most one send per 20 ms. The send
//! is non-blocking: a consumer that stops draining fails the stream
//! instead of wedging the adapter.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use cf_domain::error::{Error, Result};

pub(crate) const EMIT_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) struct EmitBuffer {
    tx: mpsc::Sender<String>,
    buf: String,
    last_emit: Instant,
    interval: Duration,
}

impl EmitBuffer {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self::with_interval(tx, EMIT_INTERVAL)
    }

    pub fn with_interval(tx: mpsc::Sender<String>, interval: Duration) -> Self {
        Self {
            tx,
            buf: String::new(),
            last_emit: Instant::now(),
            interval,
        }
    }

    /// Append content; emit the accumulated buffer once the emit interval
    /// has elapsed since the last send.
    pub fn push(&mut self, content: &str) -> Result<()> {
        self.buf.push_str(content);
        if self.last_emit.elapsed() >= self.interval {
            self.flush()?;
        }
        Ok(())
    }

    /// Emit whatever is buffered, if anything.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        match self.tx.try_send(std::mem::take(&mut self.buf)) {
            Ok(()) => {
                self.last_emit = Instant::now();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                Err(Error::InvalidResponse("response stream is blocked".into()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(Error::InvalidResponse("response stream is closed".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coalesces_until_interval_elapses() {
        let (tx, mut rx) = mpsc::channel(10);
        let mut buffer = EmitBuffer::with_interval(tx, Duration::from_secs(60));

        buffer.push("Hi").unwrap();
        buffer.push(" there").unwrap();
        assert!(rx.try_recv().is_err(), "nothing emitted inside the interval");

        buffer.flush().unwrap();
        assert_eq!(rx.recv().await.unwrap(), "Hi there");
    }

    #[tokio::test]
    async fn emits_once_interval_has_passed() {
        let (tx, mut rx) = mpsc::channel(10);
        let mut buffer = EmitBuffer::with_interval(tx, Duration::from_millis(1));

        tokio::time::sleep(Duration::from_millis(5)).await;
        buffer.push("token").unwrap();
        assert_eq!(rx.recv().await.unwrap(), "token");
    }

    #[tokio::test]
    async fn full_channel_is_an_error() {
        let (tx, _rx) = mpsc::channel(1);
        let mut buffer = EmitBuffer::with_interval(tx, Duration::from_millis(0));

        buffer.push("first").unwrap();
        let err = buffer.push("second").unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(msg) if msg.contains("blocked")));
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut buffer = EmitBuffer::with_interval(tx, Duration::from_millis(0));
        let err = buffer.push("orphan").unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(msg) if msg.contains("closed")));
    }

    #[tokio::test]
    async fn flush_on_empty_is_noop() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut buffer = EmitBuffer::new(tx);
        buffer.flush().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
