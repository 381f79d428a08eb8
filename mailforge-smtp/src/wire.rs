//! Line-oriented framing for the SMTP wire: CRLF-terminated command lines
//! with a maximum-length guard, and the dot-stuffed DATA body transfer.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::WireError;

/// Maximum command line length in octets, excluding CRLF (RFC 5321 4.5.3.1.4).
pub const MAX_COMMAND_LINE: usize = 998;

/// Maximum DATA line length in octets, excluding CRLF.
pub const MAX_DATA_LINE: usize = 1000;

const READ_CHUNK: usize = 8192;

/// Outcome of reading a DATA body.
#[derive(Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// Terminator seen; decoded bytes and the size of the original
    /// (dot-stuffed) stream.
    Complete { body: Vec<u8>, wire_size: usize },
    /// The decoded body exceeded the cap. The stream was consumed up to the
    /// terminator so the session stays in sync.
    SizeExceeded { wire_size: usize },
}

/// Buffered CRLF line reader.
///
/// The internal buffer is what makes pipelining work: a client may write
/// several commands in one segment and each `read_line` call consumes exactly
/// one of them, so replies are generated strictly in command order.
#[derive(Debug)]
pub struct LineReader {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

impl LineReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0; READ_CHUNK],
            start: 0,
            end: 0,
        }
    }

    /// Discard all buffered bytes. Required after a TLS upgrade: anything the
    /// client pipelined in plaintext must not survive the handshake.
    pub const fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// True if a full line is already buffered (useful for tests).
    #[must_use]
    pub fn has_buffered_line(&self) -> bool {
        find_crlf(&self.buf[self.start..self.end]).is_some()
    }

    /// Read one CRLF-terminated line, excluding the terminator.
    ///
    /// A line longer than `max_len` is drained up to its CRLF and reported as
    /// `WireError::LineTooLong` so the session can answer 500 and keep going.
    pub async fn read_line<S>(&mut self, stream: &mut S, max_len: usize) -> Result<Vec<u8>, WireError>
    where
        S: AsyncRead + Unpin + Send,
    {
        loop {
            if let Some(pos) = find_crlf(&self.buf[self.start..self.end]) {
                let line_start = self.start;
                self.start += pos + 2;

                if pos > max_len {
                    return Err(WireError::LineTooLong { max: max_len });
                }

                return Ok(self.buf[line_start..line_start + pos].to_vec());
            }

            // An over-long line with no terminator yet: drop what we have and
            // keep draining until CRLF so the next command parses cleanly.
            if self.end - self.start > max_len + 1 {
                self.drain_until_crlf(stream).await?;
                return Err(WireError::LineTooLong { max: max_len });
            }

            self.fill(stream).await?;
        }
    }

    /// Read exactly `n` raw octets, buffered bytes first. Used by BDAT.
    pub async fn read_exact<S>(&mut self, stream: &mut S, n: usize) -> Result<Vec<u8>, WireError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut out = Vec::with_capacity(n);

        let buffered = (self.end - self.start).min(n);
        out.extend_from_slice(&self.buf[self.start..self.start + buffered]);
        self.start += buffered;

        while out.len() < n {
            let mut chunk = vec![0; (n - out.len()).min(READ_CHUNK)];
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(WireError::Closed);
            }
            out.extend_from_slice(&chunk[..read]);
        }

        Ok(out)
    }

    /// Read a dot-stuffed DATA body terminated by the bare `.` line.
    ///
    /// `max_size` of zero disables the size cap. On overflow the stream is
    /// still consumed to the terminator; the caller replies 552 and the
    /// session continues.
    pub async fn read_data<S>(
        &mut self,
        stream: &mut S,
        max_size: usize,
    ) -> Result<DataOutcome, WireError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut body = Vec::new();
        let mut wire_size = 0;
        let mut exceeded = false;

        loop {
            let line = self.read_line(stream, MAX_DATA_LINE).await?;
            wire_size += line.len() + 2;

            if line == b"." {
                return Ok(if exceeded {
                    DataOutcome::SizeExceeded { wire_size }
                } else {
                    DataOutcome::Complete { body, wire_size }
                });
            }

            if exceeded {
                continue;
            }

            let decoded: &[u8] = if line.first() == Some(&b'.') {
                &line[1..]
            } else {
                &line
            };

            if max_size > 0 && body.len() + decoded.len() + 2 > max_size {
                exceeded = true;
                body.clear();
                continue;
            }

            body.extend_from_slice(decoded);
            body.extend_from_slice(b"\r\n");
        }
    }

    async fn fill<S>(&mut self, stream: &mut S) -> Result<(), WireError>
    where
        S: AsyncRead + Unpin + Send,
    {
        // Compact before growing
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        if self.end == self.buf.len() {
            self.buf.resize(self.buf.len() + READ_CHUNK, 0);
        }

        let read = stream.read(&mut self.buf[self.end..]).await?;
        if read == 0 {
            return Err(WireError::Closed);
        }
        self.end += read;
        Ok(())
    }

    async fn drain_until_crlf<S>(&mut self, stream: &mut S) -> Result<(), WireError>
    where
        S: AsyncRead + Unpin + Send,
    {
        loop {
            if let Some(pos) = find_crlf(&self.buf[self.start..self.end]) {
                self.start += pos + 2;
                return Ok(());
            }

            // Nothing before the terminator matters; keep only a trailing CR
            // that might pair with the next LF.
            let keep = usize::from(self.buf[..self.end].last() == Some(&b'\r'));
            if keep == 1 {
                self.buf[0] = b'\r';
            }
            self.start = 0;
            self.end = keep;

            let read = stream.read(&mut self.buf[self.end..]).await?;
            if read == 0 {
                return Err(WireError::Closed);
            }
            self.end += read;
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Dot-stuff a message body for transmission: prefix an extra `.` to lines
/// that begin with one, normalise the trailing line ending, and append the
/// terminating `.` line.
#[must_use]
pub fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);

    for line in split_crlf(body) {
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b".\r\n");
    out
}

fn split_crlf(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    let trimmed = body.strip_suffix(b"\r\n").unwrap_or(body);
    SplitCrlf {
        rest: if body.is_empty() { None } else { Some(trimmed) },
    }
}

struct SplitCrlf<'a> {
    rest: Option<&'a [u8]>,
}

impl<'a> Iterator for SplitCrlf<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest?;
        match find_crlf(rest) {
            Some(pos) => {
                self.rest = Some(&rest[pos + 2..]);
                Some(&rest[..pos])
            }
            None => {
                self.rest = None;
                Some(rest)
            }
        }
    }
}
