//! Tail capture of child stderr.
//!
//! Fatal child exits must surface a diagnostic without shipping the whole
//! log: the tail ring keeps the last ~1 KiB of stderr, and each line is also
//! forwarded to `tracing` at debug level (sanitized).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use crate::sanitize::sanitize_for_log_n;

/// Bytes of child stderr retained for diagnostics.
pub const TAIL_CAPACITY: usize = 1024;

/// Shared ring over the last [`TAIL_CAPACITY`] bytes of a child's stderr.
#[derive(Debug, Clone, Default)]
pub struct LogTail {
    ring: Arc<Mutex<VecDeque<u8>>>,
}

impl LogTail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `stderr` line by line until EOF, feeding the ring.
    /// Runs as a background task; completes when the child closes the pipe.
    pub fn capture<R>(&self, stderr: R, backend: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let ring = Arc::clone(&self.ring);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(backend, line = %sanitize_for_log_n(&line, 200), "engine stderr");
                let mut ring = ring.lock().expect("log tail poisoned");
                for b in line.as_bytes() {
                    if ring.len() == TAIL_CAPACITY {
                        ring.pop_front();
                    }
                    ring.push_back(*b);
                }
                if ring.len() == TAIL_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(b'\n');
            }
        });
    }

    /// The retained tail as lossy UTF-8.
    pub fn contents(&self) -> String {
        let ring = self.ring.lock().expect("log tail poisoned");
        let (a, b) = ring.as_slices();
        let mut bytes = Vec::with_capacity(ring.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn feed(tail: &LogTail, input: &'static [u8]) {
        tail.capture(input, "test");
        // The capture task drains a static buffer immediately; give it a tick.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn captures_short_output_verbatim() {
        let tail = LogTail::new();
        feed(&tail, b"error: model file truncated\n").await;
        assert_eq!(tail.contents(), "error: model file truncated\n");
    }

    #[tokio::test]
    async fn keeps_only_the_last_kibibyte() {
        let tail = LogTail::new();
        let big: &'static [u8] = Box::leak(
            (0..100)
                .flat_map(|i| format!("line number {i:04}\n").into_bytes())
                .collect::<Vec<u8>>()
                .into_boxed_slice(),
        );
        feed(&tail, big).await;

        let contents = tail.contents();
        assert!(contents.len() <= TAIL_CAPACITY);
        assert!(contents.contains("line number 0099"), "newest lines retained");
        assert!(!contents.contains("line number 0000"), "oldest lines dropped");
    }
}
