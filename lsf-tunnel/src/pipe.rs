//! In-memory byte pipe between a frame reader and a stream consumer.
//!
//! A single producer appends frame payloads with [`Pipe::write`] and a single
//! consumer drains them with [`Pipe::read`] or [`Pipe::read_async`]. Either
//! side can end the pipe with an error:
//!
//! - [`Pipe::close_with_error`] lets the consumer drain what is buffered
//!   before the error is reported.
//! - [`Pipe::break_with_error`] drops buffered bytes (counting them as
//!   unread) and reports the error immediately.
//!
//! The first terminal transition also fires the done signal.

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Terminal errors reported by a [`Pipe`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipeError {
    #[error("write on closed buffer")]
    ClosedWrite,

    #[error("backend closed the stream")]
    BackendClosed,

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("tunnel transport error: {0}")]
    Transport(String),
}

#[derive(Debug)]
enum Phase {
    Open,
    Draining(PipeError),
    Broken(PipeError),
}

#[derive(Debug)]
struct State {
    buf: BytesMut,
    unread: usize,
    phase: Phase,
}

impl State {
    /// `None` means the reader has to wait.
    fn try_read(&mut self, out: &mut [u8]) -> Option<Result<usize, PipeError>> {
        if let Phase::Broken(err) = &self.phase {
            return Some(Err(err.clone()));
        }
        if !self.buf.is_empty() {
            let n = out.len().min(self.buf.len());
            out[..n].copy_from_slice(&self.buf.split_to(n));
            return Some(Ok(n));
        }
        match &self.phase {
            Phase::Draining(err) => Some(Err(err.clone())),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Pipe {
    state: Mutex<State>,
    readable: Condvar,
    notify: Notify,
    done: CancellationToken,
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                buf: BytesMut::new(),
                unread: 0,
                phase: Phase::Open,
            }),
            readable: Condvar::new(),
            notify: Notify::new(),
            done: CancellationToken::new(),
        }
    }

    /// Append `data`. Fails with [`PipeError::ClosedWrite`] once the pipe
    /// was closed or broken.
    pub fn write(&self, data: &[u8]) -> Result<usize, PipeError> {
        {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Open) {
                return Err(PipeError::ClosedWrite);
            }
            state.buf.extend_from_slice(data);
        }
        self.wake();
        Ok(data.len())
    }

    /// Blocking read. Waits until bytes are buffered or the pipe ends.
    ///
    /// Must not be called from an async context; use [`Self::read_async`]
    /// there.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, PipeError> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.try_read(out) {
                return result;
            }
            self.readable.wait(&mut state);
        }
    }

    /// Async read with the same semantics as [`Self::read`].
    pub async fn read_async(&self, out: &mut [u8]) -> Result<usize, PipeError> {
        loop {
            // Registered before checking so a write in between leaves a permit.
            let notified = self.notify.notified();
            if let Some(result) = self.state.lock().try_read(out) {
                return result;
            }
            notified.await;
        }
    }

    /// End the pipe with `err` after the buffered bytes are consumed.
    ///
    /// No-op once the pipe has ended.
    pub fn close_with_error(&self, err: PipeError) {
        {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Open) {
                return;
            }
            state.phase = Phase::Draining(err);
        }
        self.done.cancel();
        self.wake();
    }

    /// End the pipe with `err` now, discarding buffered bytes.
    ///
    /// A pipe that is still draining is upgraded to broken. No-op once the
    /// pipe is broken.
    pub fn break_with_error(&self, err: PipeError) {
        {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Broken(_)) {
                return;
            }
            let dropped = state.buf.len();
            state.unread += dropped;
            state.buf = BytesMut::new();
            state.phase = Phase::Broken(err);
        }
        self.done.cancel();
        self.wake();
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes discarded by [`Self::break_with_error`].
    pub fn unread(&self) -> usize {
        self.state.lock().unread
    }

    /// The terminal error, if the pipe has ended.
    pub fn err(&self) -> Option<PipeError> {
        match &self.state.lock().phase {
            Phase::Open => None,
            Phase::Draining(err) | Phase::Broken(err) => Some(err.clone()),
        }
    }

    /// Token cancelled on the first terminal transition.
    ///
    /// The returned token is a child, so cancelling it does not end the pipe.
    pub fn done(&self) -> CancellationToken {
        self.done.child_token()
    }

    fn wake(&self) {
        self.readable.notify_all();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    fn err(msg: &str) -> PipeError {
        PipeError::Transport(msg.to_string())
    }

    #[test]
    fn test_reads_in_order() {
        let pipe = Pipe::new();
        pipe.write(b"hello ").unwrap();
        pipe.write(b"world").unwrap();

        let mut out = [0u8; 4];
        let mut collected = Vec::new();
        while !pipe.is_empty() {
            let n = pipe.read(&mut out).unwrap();
            collected.extend_from_slice(&out[..n]);
        }
        assert_eq!(collected, b"hello world");
    }

    #[test]
    fn test_close_drains_then_reports() {
        let pipe = Pipe::new();
        pipe.write(b"b1").unwrap();
        pipe.write(b"b2").unwrap();
        pipe.close_with_error(err("E"));

        let mut out = [0u8; 16];
        let n = pipe.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"b1b2");
        assert_eq!(pipe.read(&mut out), Err(err("E")));
        assert_eq!(pipe.read(&mut out), Err(err("E")));
        assert_eq!(pipe.unread(), 0);
    }

    #[test]
    fn test_break_discards_buffer() {
        let pipe = Pipe::new();
        pipe.write(b"b1").unwrap();
        pipe.write(b"b2").unwrap();
        pipe.break_with_error(err("E"));

        let mut out = [0u8; 16];
        assert_eq!(pipe.read(&mut out), Err(err("E")));
        assert_eq!(pipe.len(), 0);
        assert_eq!(pipe.unread(), 4);
    }

    #[test]
    fn test_write_after_end_fails() {
        let pipe = Pipe::new();
        pipe.close_with_error(err("E"));
        assert_eq!(pipe.write(b"x"), Err(PipeError::ClosedWrite));

        let pipe = Pipe::new();
        pipe.break_with_error(err("E"));
        assert_eq!(pipe.write(b"x"), Err(PipeError::ClosedWrite));
        assert_eq!(PipeError::ClosedWrite.to_string(), "write on closed buffer");
    }

    #[test]
    fn test_first_error_wins() {
        let pipe = Pipe::new();
        pipe.close_with_error(err("first"));
        pipe.close_with_error(err("second"));
        assert_eq!(pipe.err(), Some(err("first")));

        // A break replaces a pending drain, a second break does not.
        pipe.break_with_error(err("broken"));
        pipe.break_with_error(err("again"));
        assert_eq!(pipe.err(), Some(err("broken")));

        pipe.close_with_error(err("late"));
        assert_eq!(pipe.err(), Some(err("broken")));
    }

    #[test]
    fn test_break_during_drain_counts_remaining() {
        let pipe = Pipe::new();
        pipe.write(b"abcdef").unwrap();
        pipe.close_with_error(err("E"));

        let mut out = [0u8; 2];
        assert_eq!(pipe.read(&mut out), Ok(2));
        pipe.break_with_error(err("B"));

        assert_eq!(pipe.unread(), 4);
        assert_eq!(pipe.read(&mut out), Err(err("B")));
    }

    #[test]
    fn test_done_fires_once_ended() {
        let pipe = Pipe::new();
        let done = pipe.done();
        assert!(!done.is_cancelled());
        assert_eq!(pipe.err(), None);

        pipe.close_with_error(err("E"));
        assert!(done.is_cancelled());
        assert!(pipe.done().is_cancelled());
    }

    #[test]
    fn test_blocking_reader_wakes_on_write() {
        let pipe = Arc::new(Pipe::new());
        let reader = {
            let pipe = Arc::clone(&pipe);
            thread::spawn(move || {
                let mut out = [0u8; 8];
                let n = pipe.read(&mut out).unwrap();
                out[..n].to_vec()
            })
        };

        thread::sleep(Duration::from_millis(20));
        pipe.write(b"late").unwrap();
        assert_eq!(reader.join().unwrap(), b"late");
    }

    #[test]
    fn test_blocking_reader_wakes_on_break() {
        let pipe = Arc::new(Pipe::new());
        let reader = {
            let pipe = Arc::clone(&pipe);
            thread::spawn(move || pipe.read(&mut [0u8; 8]))
        };

        thread::sleep(Duration::from_millis(20));
        pipe.break_with_error(PipeError::TunnelClosed);
        assert_eq!(reader.join().unwrap(), Err(PipeError::TunnelClosed));
    }

    #[tokio::test]
    async fn test_async_reader() {
        let pipe = Arc::new(Pipe::new());
        let reader = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move {
                let mut collected = Vec::new();
                let mut out = [0u8; 3];
                loop {
                    match pipe.read_async(&mut out).await {
                        Ok(n) => collected.extend_from_slice(&out[..n]),
                        Err(e) => return (collected, e),
                    }
                }
            })
        };

        for chunk in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            pipe.write(chunk).unwrap();
            tokio::task::yield_now().await;
        }
        pipe.close_with_error(PipeError::BackendClosed);

        let (collected, e) = reader.await.unwrap();
        assert_eq!(collected, b"onetwothree");
        assert_eq!(e, PipeError::BackendClosed);
    }
}
