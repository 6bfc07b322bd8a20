//! Shared capture store for subprocess output.
//!
//! A [`CaptureBuffer`] records every byte a subprocess writes to one of its
//! output streams and hands out any number of independent [`CaptureReader`]
//! views over those bytes. A reader that has caught up with the writer
//! blocks until more bytes arrive or the writer closes, so output can be
//! consumed incrementally while a simultaneous wait for the full result is
//! in flight.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct CaptureBuffer {
    state: Mutex<State>,
    readable: Notify,
}

#[derive(Debug, Default)]
struct State {
    data: Vec<u8>,
    closed: bool,
}

impl CaptureBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(CaptureBuffer::default())
    }

    /// Appends bytes to the buffer and wakes blocked readers. Readers never
    /// observe a size increase before the bytes themselves are in place; the
    /// lock is released before waiters are notified.
    pub fn append(&self, bytes: &[u8]) {
        {
            let mut state = self.state.lock().unwrap();
            state.data.extend_from_slice(bytes);
        }
        self.readable.notify_waiters();
    }

    /// Marks the buffer complete. Readers that drain the remaining bytes
    /// observe end of stream.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.readable.notify_waiters();
    }

    /// A snapshot of everything written so far.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().unwrap().data)
    }

    pub fn reader(self: &Arc<Self>) -> CaptureReader {
        CaptureReader {
            buffer: Arc::clone(self),
            position: 0,
            mark: 0,
        }
    }
}

/// An independent, replayable view over a [`CaptureBuffer`].
#[derive(Debug)]
pub struct CaptureReader {
    buffer: Arc<CaptureBuffer>,
    position: usize,
    mark: usize,
}

impl CaptureReader {
    /// Waits until at least one byte past the current position exists or the
    /// buffer is closed, and returns the number of immediately readable
    /// bytes. Zero means end of stream.
    async fn wait_for_bytes(&self) -> usize {
        loop {
            let notified = self.buffer.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.buffer.state.lock().unwrap();
                if state.data.len() > self.position {
                    return state.data.len() - self.position;
                }
                if state.closed {
                    return 0;
                }
            }
            notified.await;
        }
    }

    /// Reads available bytes into `buf`, blocking while caught up with the
    /// writer. Returns 0 only at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let available = self.wait_for_bytes().await;
        if available == 0 {
            return 0;
        }
        let n = available.min(buf.len());
        let state = self.buffer.state.lock().unwrap();
        buf[..n].copy_from_slice(&state.data[self.position..self.position + n]);
        drop(state);
        self.position += n;
        n
    }

    /// Reads everything up to end of stream.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.read(&mut chunk).await;
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads the next newline-terminated line, without the terminator.
    /// Blocks until a full line is available; at end of stream any
    /// unterminated remainder is returned, then `None`.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            {
                let state = self.buffer.state.lock().unwrap();
                if let Some(offset) = state.data[self.position..]
                    .iter()
                    .position(|&b| b == b'\n')
                {
                    let line = &state.data[self.position..self.position + offset];
                    let line = String::from_utf8_lossy(line).into_owned();
                    drop(state);
                    self.position += offset + 1;
                    return Some(line);
                }
                if state.closed {
                    if self.position == state.data.len() {
                        return None;
                    }
                    let line =
                        String::from_utf8_lossy(&state.data[self.position..]).into_owned();
                    self.position = state.data.len();
                    return Some(line);
                }
            }
            let notified = self.buffer.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.buffer.state.lock().unwrap();
                if state.closed || state.data.len() > self.position {
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Bytes readable right now without blocking.
    pub fn available(&self) -> usize {
        let state = self.buffer.state.lock().unwrap();
        state.data.len().saturating_sub(self.position)
    }

    /// Remembers the current position for a later [`reset`](Self::reset).
    pub fn mark(&mut self) {
        self.mark = self.position;
    }

    /// Rewinds to the last [`mark`](Self::mark), or the start if none was
    /// set.
    pub fn reset(&mut self) {
        self.position = self.mark;
    }
}
