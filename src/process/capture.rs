//! Capture pipeline - merges a child's stdout and stderr into one line channel
//!
//! Each stream gets its own reader task. Both readers send into clones of the
//! same bounded sender, so the channel itself is the merge point and closes once
//! the last reader hits EOF. Sends await capacity: a consumer that stops
//! draining stalls the readers, and through the OS pipe, the child.

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lines buffered per process in the default configuration
pub const DEFAULT_CAPACITY: usize = 100;

/// Longest line emitted in one piece; longer lines are split
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Bounds applied to one process's captured output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    /// Lines buffered before the readers block
    pub channel_capacity: usize,
    /// Bytes of a line, terminator excluded, before it is split
    pub max_line_bytes: usize,
}

impl CaptureLimits {
    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            channel_capacity,
            ..Self::default()
        }
    }
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CAPACITY,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// One decoded line of process output, without its terminator
pub type OutputLine = String;

/// Receiving end of a process's merged output
#[derive(Debug)]
pub struct OutputReceiver {
    rx: mpsc::Receiver<OutputLine>,
}

impl OutputReceiver {
    /// Next line, or `None` once both streams have closed
    pub async fn recv(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }

    /// Drain every remaining line until the channel closes
    pub async fn collect(mut self) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        while let Some(line) = self.rx.recv().await {
            lines.push(line);
        }
        lines
    }
}

/// Start capturing the given streams, returning the merged line channel.
///
/// Missing streams count as already closed; with neither present the
/// returned receiver yields `None` immediately.
pub fn attach<O, E>(stdout: Option<O>, stderr: Option<E>, limits: CaptureLimits) -> OutputReceiver
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(limits.channel_capacity.max(1));
    let max_line = limits.max_line_bytes.max(1);

    if let Some(stdout) = stdout {
        spawn_reader("stdout", stdout, max_line, tx.clone());
    }
    if let Some(stderr) = stderr {
        spawn_reader("stderr", stderr, max_line, tx.clone());
    }

    // Readers hold the only senders from here on
    drop(tx);

    OutputReceiver { rx }
}

fn spawn_reader<R>(
    stream: &'static str,
    reader: R,
    max_line: usize,
    tx: mpsc::Sender<OutputLine>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut consumer_gone = false;

        loop {
            buf.clear();
            match read_line_capped(&mut reader, &mut buf, max_line).await {
                Ok(0) => break,
                Ok(_) => {
                    if consumer_gone {
                        continue;
                    }
                    if tx.send(decode_line(&buf)).await.is_err() {
                        // Keep draining so the child never blocks on a full pipe
                        debug!(stream, "Output receiver dropped, discarding further lines");
                        consumer_gone = true;
                    }
                }
                Err(e) => {
                    warn!(stream, "Failed to read process output: {e}");
                    break;
                }
            }
        }
    });
}

/// Like `read_until(b'\n')`, but stops after `max` bytes of line content so a
/// child that never writes a newline cannot grow the buffer without bound.
/// The rest of an over-long line comes back on the following calls.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read);
        }

        // One byte past the room left, so a newline right at the cap still ends the line
        let room = max - buf.len();
        let window = &available[..available.len().min(room + 1)];
        let (used, done) = match window.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => {
                let used = window.len().min(room);
                (used, buf.len() + used >= max)
            }
        };

        buf.extend_from_slice(&available[..used]);
        reader.consume(used);
        read += used;
        if done {
            return Ok(read);
        }
    }
}

/// Strip the line terminator and decode, replacing invalid UTF-8
pub fn decode_line(bytes: &[u8]) -> OutputLine {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const NONE: Option<&'static [u8]> = None;

    #[test]
    fn test_decode_line_strips_terminators() {
        assert_eq!(decode_line(b"line1\n"), "line1");
        assert_eq!(decode_line(b"line2\r\n"), "line2");
        assert_eq!(decode_line(b"tail"), "tail");
        assert_eq!(decode_line(b"\n"), "");
    }

    #[test]
    fn test_decode_line_is_lossy() {
        assert_eq!(decode_line(b"ok \xff\xfe end\n"), "ok \u{fffd}\u{fffd} end");
    }

    #[tokio::test]
    async fn test_final_line_without_newline_is_flushed() {
        let stdout: &'static [u8] = b"line1\nline2";
        let lines = attach(Some(stdout), NONE, CaptureLimits::with_capacity(8)).collect().await;
        assert_eq!(lines, vec!["line1", "line2"]);
    }

    #[tokio::test]
    async fn test_no_streams_closes_immediately() {
        let mut output = attach(NONE, NONE, CaptureLimits::default());
        assert_eq!(output.recv().await, None);
    }

    #[tokio::test]
    async fn test_merges_both_streams_preserving_per_stream_order() {
        let stdout: &'static [u8] = b"out1\nout2\nout3\n";
        let stderr: &'static [u8] = b"err1\nerr2\n";
        let limits = CaptureLimits::with_capacity(8);
        let lines = attach(Some(stdout), Some(stderr), limits).collect().await;

        assert_eq!(lines.len(), 5);
        let out: Vec<_> = lines.iter().filter(|l| l.starts_with("out")).collect();
        let err: Vec<_> = lines.iter().filter(|l| l.starts_with("err")).collect();
        assert_eq!(out, vec!["out1", "out2", "out3"]);
        assert_eq!(err, vec!["err1", "err2"]);
    }

    #[tokio::test]
    async fn test_full_channel_blocks_instead_of_dropping() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut output = attach(Some(reader), NONE, CaptureLimits::with_capacity(1));

        writer.write_all(b"a\nb\nc\n").await.unwrap();
        drop(writer);

        // Give the reader time to fill the channel and park on send
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut lines = Vec::new();
        while let Some(line) = output.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_dropped_receiver_keeps_draining_source() {
        let (mut writer, reader) = tokio::io::duplex(16);
        let output = attach(Some(reader), NONE, CaptureLimits::with_capacity(1));
        drop(output);

        // Far more than the duplex buffer: only completes if the reader keeps reading
        let payload = "x".repeat(15) + "\n";
        let write = async {
            for _ in 0..100 {
                writer.write_all(payload.as_bytes()).await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), write)
            .await
            .expect("writer should not stall once the receiver is gone");
    }

    #[tokio::test]
    async fn test_long_line_is_split_at_cap() {
        let limits = CaptureLimits {
            channel_capacity: 8,
            max_line_bytes: 8,
        };
        let stdout: &'static [u8] = b"abcdefghijklmnopqrst";
        let lines = attach(Some(stdout), NONE, limits).collect().await;
        assert_eq!(lines, vec!["abcdefgh", "ijklmnop", "qrst"]);
    }

    #[tokio::test]
    async fn test_newline_at_cap_ends_line() {
        let limits = CaptureLimits {
            channel_capacity: 8,
            max_line_bytes: 4,
        };
        let stdout: &'static [u8] = b"abcd\nefghij\nk\n";
        let lines = attach(Some(stdout), NONE, limits).collect().await;
        assert_eq!(lines, vec!["abcd", "efgh", "ij", "k"]);
    }

    #[tokio::test]
    async fn test_default_cap_bounds_unterminated_output() {
        // Written in small chunks, never a newline
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut output = attach(Some(reader), NONE, CaptureLimits::default());

        let chunk = vec![b'x'; 1000];
        let write = async move {
            for _ in 0..100 {
                writer.write_all(&chunk).await.unwrap();
            }
        };
        tokio::spawn(write);

        let first = tokio::time::timeout(Duration::from_secs(5), output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), DEFAULT_MAX_LINE_BYTES);

        let rest = output.collect().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].len(), 100_000 - DEFAULT_MAX_LINE_BYTES);
    }
}
