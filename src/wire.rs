//! NDJSON framing for [`UpdateEvent`]s.
//!
//! Stream tokens are right-padded with NUL characters to a fixed length before they go on
//! the wire so packet sizes do not leak token lengths. Consumers strip them again.

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::update::{UpdateEvent, KNOWN_KINDS};

/// Minimum length (in characters) of a stream token on the wire.
pub const TOKEN_PAD_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event has no type tag")]
    MissingType,
}

/// Remove every NUL character from a token.
pub fn strip_nul(token: &str) -> String {
    if token.contains('\0') {
        token.replace('\0', "")
    } else {
        token.to_string()
    }
}

fn pad_token(token: &str) -> String {
    let len = token.chars().count();
    let mut padded = token.to_string();
    if len < TOKEN_PAD_LEN {
        padded.extend(std::iter::repeat('\0').take(TOKEN_PAD_LEN - len));
    }
    padded
}

/// Serialize one event as a newline-terminated JSON line.
pub fn encode_line(event: &UpdateEvent) -> Result<String, WireError> {
    let mut line = match event {
        UpdateEvent::Stream { token } => serde_json::to_string(&UpdateEvent::Stream {
            token: pad_token(token),
        })?,
        other => serde_json::to_string(other)?,
    };
    line.push('\n');
    Ok(line)
}

/// Parse one line. Blank lines and events of an unknown kind yield `Ok(None)`.
pub fn decode_line(line: &str) -> Result<Option<UpdateEvent>, WireError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_str(trimmed)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(WireError::MissingType)?;
    if !KNOWN_KINDS.contains(&kind) {
        debug!(kind = %kind, "ignoring unknown update kind");
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

/// Turn a line-oriented reader into an event stream. Malformed lines are logged and skipped.
pub fn read_events<R>(reader: R) -> BoxStream<'static, UpdateEvent>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let lines = reader.lines();
    futures::stream::unfold(lines, |mut lines| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match decode_line(&line) {
                    Ok(Some(event)) => return Some((event, lines)),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "skipping malformed update line");
                        continue;
                    }
                },
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "update stream read failed");
                    return None;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Status;

    #[test]
    fn test_stream_token_padded_on_wire() {
        let line = encode_line(&UpdateEvent::stream("hi")).unwrap();
        assert!(line.ends_with('\n'));
        let decoded = decode_line(&line).unwrap().unwrap();
        match decoded {
            UpdateEvent::Stream { token } => {
                assert_eq!(token.chars().count(), TOKEN_PAD_LEN);
                assert_eq!(strip_nul(&token), "hi");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_long_token_not_truncated() {
        let long = "a".repeat(40);
        let line = encode_line(&UpdateEvent::stream(long.clone())).unwrap();
        match decode_line(&line).unwrap().unwrap() {
            UpdateEvent::Stream { token } => assert_eq!(token, long),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_ignored() {
        assert!(decode_line(r#"{"type":"telemetry","x":1}"#)
            .unwrap()
            .is_none());
        assert!(decode_line("   ").unwrap().is_none());
        assert!(matches!(
            decode_line(r#"{"status":"started"}"#),
            Err(WireError::MissingType)
        ));
        assert!(decode_line("{not json").is_err());
    }

    #[tokio::test]
    async fn test_read_events_skips_bad_lines() {
        let body = concat!(
            "{\"type\":\"status\",\"status\":\"started\"}\n",
            "garbage\n",
            "{\"type\":\"mystery\"}\n",
            "\n",
            "{\"type\":\"status\",\"status\":\"finished\"}\n",
        );
        let events: Vec<UpdateEvent> = read_events(std::io::Cursor::new(body.as_bytes().to_vec()))
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                UpdateEvent::status(Status::Started),
                UpdateEvent::status(Status::Finished)
            ]
        );
    }

    #[tokio::test]
    async fn test_read_events_across_chunks() {
        let line = encode_line(&UpdateEvent::stream("hi")).unwrap();
        let (head, tail) = line.split_at(10);
        let reader = tokio_test::io::Builder::new()
            .read(head.as_bytes())
            .read(tail.as_bytes())
            .read(b"{\"type\":\"status\",\"status\":\"fini")
            .read(b"shed\"}\n")
            .build();
        let events: Vec<UpdateEvent> = read_events(tokio::io::BufReader::new(reader)).collect().await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            UpdateEvent::Stream { token } => assert_eq!(strip_nul(token), "hi"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events[1], UpdateEvent::status(Status::Finished));
    }
}
