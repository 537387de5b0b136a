//! Shared plumbing for server-sent-event streams and HTTP error mapping.

use futures::StreamExt;
use toolweave_core::error::ProviderError;
use toolweave_core::provider::StreamDelta;
use tokio::sync::mpsc;
use tracing::warn;

/// Splits an SSE byte stream into complete lines.
///
/// Bytes are buffered raw and decoded one complete line at a time, so a
/// multi-byte character split across chunks survives intact.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    /// Append bytes and drain every complete line (without the trailing `\r\n`).
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..end]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }
}

/// Map a non-success HTTP status and body into a typed error.
pub(crate) fn error_for_status(status: u16, body: String) -> ProviderError {
    let lower = body.to_lowercase();
    let context_overflow = status == 413
        || lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("prompt is too long")
        || lower.contains("too many tokens");

    match status {
        _ if context_overflow => ProviderError::ContextLengthExceeded(truncate(&body, 300)),
        429 => ProviderError::RateLimited {
            retry_after_secs: 5,
        },
        401 | 403 => ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ),
        404 => ProviderError::ModelNotFound(truncate(&body, 300)),
        _ => {
            warn!(status, body = %truncate(&body, 500), "Provider returned error");
            ProviderError::ApiError {
                status_code: status,
                message: truncate(&body, 500),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Drive a response body through `parse` on a spawned task.
///
/// `parse` receives each complete line and returns the deltas it produced plus
/// whether the stream is finished. A terminal `Done` is always emitted once.
pub(crate) fn spawn_sse<F>(
    response: reqwest::Response,
    mut parse: F,
) -> mpsc::Receiver<Result<StreamDelta, ProviderError>>
where
    F: FnMut(&str) -> (Vec<StreamDelta>, bool) + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut byte_stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut finish_reason_sent = false;

        while let Some(chunk) = byte_stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    let _ = tx
                        .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                        .await;
                    return;
                }
            };

            for line in lines.push(&bytes) {
                let (deltas, finished) = parse(&line);
                for delta in deltas {
                    if matches!(delta, StreamDelta::Done { .. }) {
                        finish_reason_sent = true;
                    }
                    if tx.send(Ok(delta)).await.is_err() {
                        return; // receiver dropped
                    }
                }
                if finished {
                    if !finish_reason_sent {
                        let _ = tx.send(Ok(StreamDelta::Done { finish_reason: None })).await;
                    }
                    return;
                }
            }
        }

        if !finish_reason_sent {
            let _ = tx.send(Ok(StreamDelta::Done { finish_reason: None })).await;
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_handles_split_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let lines = buf.push(b":1}\r\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "", "data: [DONE]"]);
    }

    #[test]
    fn line_buffer_keeps_characters_split_across_chunks() {
        let bytes = "data: 节点\n".as_bytes();
        let mut buf = LineBuffer::default();
        // byte 7 falls inside the three-byte 节
        assert!(buf.push(&bytes[..7]).is_empty());
        assert_eq!(buf.push(&bytes[7..]), vec!["data: 节点"]);
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            error_for_status(429, String::new()),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            error_for_status(401, String::new()),
            ProviderError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            error_for_status(400, "This model's maximum context length is 8192 tokens".into()),
            ProviderError::ContextLengthExceeded(_)
        ));
        assert!(matches!(
            error_for_status(413, String::new()),
            ProviderError::ContextLengthExceeded(_)
        ));
        let err = error_for_status(503, "overloaded".into());
        assert!(err.is_transient());
    }
}
