//! Upstream post stream.
//!
//! The ingester only sees [`PostSource`]: connect with a track term, then
//! pull raw payloads until the stream errors or ends. [`HttpPostSource`]
//! reads a newline-delimited JSON body over HTTP.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use thiserror::Error;

pub type PostStream = BoxStream<'static, Result<String, SourceError>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited by upstream (HTTP {0})")]
    RateLimited(u16),

    #[error("upstream returned HTTP {0}")]
    Status(u16),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("no data from upstream for {0:?}")]
    Timeout(Duration),
}

impl SourceError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, SourceError::RateLimited(_))
    }
}

#[async_trait]
pub trait PostSource: Send + Sync {
    /// Opens a stream of raw payloads matching `track`.
    async fn connect(&self, track: &str) -> Result<PostStream, SourceError>;
}

pub struct HttpPostSource {
    client: reqwest::Client,
    url: String,
    token: String,
    stall_timeout: Duration,
}

impl HttpPostSource {
    pub fn new(url: &str, token: &str, stall_timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("hashtag-counter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            token: token.to_string(),
            stall_timeout,
        })
    }
}

#[async_trait]
impl PostSource for HttpPostSource {
    async fn connect(&self, track: &str) -> Result<PostStream, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(&self.token)
            .query(&[("track", track)])
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 420 || status == 429 {
            return Err(SourceError::RateLimited(status));
        }
        if !response.status().is_success() {
            return Err(SourceError::Status(status));
        }

        let stall = self.stall_timeout;
        let state = ReadState {
            body: response
                .bytes_stream()
                .map(|chunk| {
                    chunk
                        .map(|bytes| bytes.to_vec())
                        .map_err(|e| SourceError::Transport(e.to_string()))
                })
                .boxed(),
            lines: LineBuffer::default(),
            done: false,
        };

        Ok(stream::unfold(state, move |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                match state.lines.next_line() {
                    Ok(Some(line)) => return Some((Ok(line), state)),
                    Ok(None) => {}
                    Err(err) => {
                        state.done = true;
                        return Some((Err(err), state));
                    }
                }
                match tokio::time::timeout(stall, state.body.next()).await {
                    Err(_) => {
                        state.done = true;
                        return Some((Err(SourceError::Timeout(stall)), state));
                    }
                    Ok(None) => return None,
                    Ok(Some(Err(err))) => {
                        state.done = true;
                        return Some((Err(err), state));
                    }
                    Ok(Some(Ok(chunk))) => state.lines.push(&chunk),
                }
            }
        })
        .boxed())
    }
}

struct ReadState {
    body: BoxStream<'static, Result<Vec<u8>, SourceError>>,
    lines: LineBuffer,
    done: bool,
}

/// Longest line accepted from upstream before the stream is abandoned.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into trimmed, non-empty lines.
///
/// Blank lines are keep-alives and never surface. A partial line longer than
/// the cap is a transport error.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    scanned: usize,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_line(&mut self) -> Result<Option<String>, SourceError> {
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=self.scanned + offset).collect();
            self.scanned = 0;
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }

        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            return Err(SourceError::Transport(format!(
                "line exceeds {} bytes without a newline",
                self.max_line
            )));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut lines = LineBuffer::default();
        lines.push(b"{\"text\":\"#a");
        assert_eq!(lines.next_line().unwrap(), None);
        lines.push(b"\"}\r\n{\"text\":\"#b\"}\n");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("{\"text\":\"#a\"}"));
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("{\"text\":\"#b\"}"));
        assert_eq!(lines.next_line().unwrap(), None);
    }

    #[test]
    fn test_keep_alive_lines_are_dropped() {
        let mut lines = LineBuffer::default();
        lines.push(b"\r\n\n  \n{}\n");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("{}"));
        assert_eq!(lines.next_line().unwrap(), None);
    }

    #[test]
    fn test_overlong_partial_line_is_rejected() {
        let mut lines = LineBuffer::new(8);
        lines.push(b"{\"a\":1}\n0123");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(lines.next_line().unwrap(), None);

        lines.push(b"45678");
        assert!(matches!(lines.next_line(), Err(SourceError::Transport(_))));
    }

    #[test]
    fn test_partial_line_completes_after_many_chunks() {
        let mut lines = LineBuffer::new(64);
        let chunks: [&[u8]; 4] = [b"{\"text\"", b":", b"\"#slow\"", b"}"];
        for chunk in chunks {
            lines.push(chunk);
            assert_eq!(lines.next_line().unwrap(), None);
        }
        lines.push(b"\n");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("{\"text\":\"#slow\"}"));
    }

    #[test]
    fn test_rate_limit_classification() {
        assert!(SourceError::RateLimited(420).is_rate_limit());
        assert!(!SourceError::Status(500).is_rate_limit());
    }
}
