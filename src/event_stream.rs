//! Incremental decoder for the store's `text/event-stream` feed.

use serde::Deserialize;
use serde_json::Value;

use crate::errors::AppError;

/// A raw server-sent event: the `event:` name and the joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub event: String,
    pub data: String,
}

/// Splits a byte stream into events. Chunks may end anywhere, including in
/// the middle of a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl EventStreamDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn dispatch(&mut self) -> Option<RawEvent> {
        let event = self.event.take();
        if event.is_none() && self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(RawEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Events of the store's streaming protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Replace the node at `path` with `data` (null deletes).
    Put { path: String, data: Value },
    /// Merge the children of `data` into the node at `path`.
    Patch { path: String, data: Value },
    KeepAlive,
    /// The server cancelled the stream (security rules no longer allow reads).
    Cancelled(String),
    /// The auth credential expired or was revoked.
    AuthRevoked,
}

#[derive(Deserialize)]
struct PathData {
    path: String,
    #[serde(default)]
    data: Value,
}

impl TryFrom<RawEvent> for StoreEvent {
    type Error = AppError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let parse = |data: &str| {
            serde_json::from_str::<PathData>(data).map_err(|e| {
                AppError::MalformedSnapshot(format!("unreadable '{}' event: {}", raw.event, e))
            })
        };

        match raw.event.as_str() {
            "put" => {
                let PathData { path, data } = parse(&raw.data)?;
                Ok(StoreEvent::Put { path, data })
            }
            "patch" => {
                let PathData { path, data } = parse(&raw.data)?;
                Ok(StoreEvent::Patch { path, data })
            }
            "keep-alive" => Ok(StoreEvent::KeepAlive),
            "cancel" => Ok(StoreEvent::Cancelled(raw.data.clone())),
            "auth_revoked" => Ok(StoreEvent::AuthRevoked),
            other => {
                tracing::debug!("Ignoring unknown stream event '{}'", other);
                Ok(StoreEvent::KeepAlive)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_events_split_across_chunks() {
        let mut decoder = EventStreamDecoder::default();
        let body = "event: put\ndata: {\"path\":\"/\",\"data\":{\"a\":1}}\n\nevent: keep-alive\ndata: null\n\n";
        let (first, second) = body.as_bytes().split_at(17);

        let mut events = decoder.feed(first);
        assert!(events.is_empty());
        events.extend(decoder.feed(second));

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "put");
        assert_eq!(
            StoreEvent::try_from(events[0].clone()).unwrap(),
            StoreEvent::Put {
                path: "/".to_string(),
                data: json!({"a": 1})
            }
        );
        assert_eq!(
            StoreEvent::try_from(events[1].clone()).unwrap(),
            StoreEvent::KeepAlive
        );
    }

    #[test]
    fn test_crlf_comments_and_multiline_data() {
        let mut decoder = EventStreamDecoder::default();
        let events = decoder.feed(b": hello\r\nevent: patch\r\ndata: {\"path\":\"/x\",\r\ndata: \"data\":{\"b\":2}}\r\n\r\n");

        assert_eq!(events.len(), 1);
        assert_eq!(
            StoreEvent::try_from(events[0].clone()).unwrap(),
            StoreEvent::Patch {
                path: "/x".to_string(),
                data: json!({"b": 2})
            }
        );
    }

    #[test]
    fn test_multibyte_boundary() {
        let mut decoder = EventStreamDecoder::default();
        let body = "event: put\ndata: {\"path\":\"/São Paulo\",\"data\":1}\n\n".as_bytes();
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut events = decoder.feed(&body[..split]);
        events.extend(decoder.feed(&body[split..]));
        assert_eq!(
            StoreEvent::try_from(events.remove(0)).unwrap(),
            StoreEvent::Put {
                path: "/São Paulo".to_string(),
                data: json!(1)
            }
        );
    }

    #[test]
    fn test_control_events() {
        let cancel = RawEvent {
            event: "cancel".to_string(),
            data: "Permission denied".to_string(),
        };
        assert_eq!(
            StoreEvent::try_from(cancel).unwrap(),
            StoreEvent::Cancelled("Permission denied".to_string())
        );

        let revoked = RawEvent {
            event: "auth_revoked".to_string(),
            data: "credential is no longer valid".to_string(),
        };
        assert_eq!(StoreEvent::try_from(revoked).unwrap(), StoreEvent::AuthRevoked);

        let broken = RawEvent {
            event: "put".to_string(),
            data: "{not json".to_string(),
        };
        assert!(StoreEvent::try_from(broken).is_err());
    }
}
