use bytes::Bytes;
use serde_json::Value as JsonValue;

use crate::upstream_client::ByteStream;

const EVENT_SEPARATOR: &[u8] = b"\n\n";

/// Incremental SSE transformer that suppresses consecutive-duplicate
/// `choices[0].delta.content` chunks while preserving event framing.
///
/// Anything that is not a parseable `data:` event, including `[DONE]`, passes
/// through verbatim. The duplicate marker is scoped to one transform.
#[derive(Debug, Default)]
pub struct SseDedup {
    buffer: Vec<u8>,
    last_content: Option<String>,
}

impl SseDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the completed events to emit, separator included.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = find_separator(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..pos + EVENT_SEPARATOR.len()).collect();
            let body = &event[..pos];
            if self.should_emit(body) {
                out.push(Bytes::from(event));
            }
        }

        out
    }

    /// Emit any unterminated trailing bytes and reset the duplicate marker.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.last_content = None;
        if self.buffer.is_empty() {
            return None;
        }
        Some(Bytes::from(std::mem::take(&mut self.buffer)))
    }

    fn should_emit(&mut self, event: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(event) else {
            return true;
        };
        let Some(data) = text.strip_prefix("data: ") else {
            return true;
        };
        if data.trim() == "[DONE]" {
            return true;
        }
        let Ok(parsed) = serde_json::from_str::<JsonValue>(data) else {
            return true;
        };
        let Some(content) = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(JsonValue::as_str)
        else {
            return true;
        };

        if self.last_content.as_deref() == Some(content) {
            return false;
        }
        self.last_content = Some(content.to_string());
        true
    }
}

fn find_separator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(EVENT_SEPARATOR.len())
        .position(|w| w == EVENT_SEPARATOR)
}

/// Pipe a raw upstream SSE byte stream through the dedup transform.
pub fn dedup_stream(mut upstream: ByteStream) -> ByteStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut dedup = SseDedup::new();
        while let Some(chunk) = upstream.recv().await {
            for event in dedup.push(&chunk) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
        if let Some(rest) = dedup.finish() {
            let _ = tx.send(rest).await;
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_event(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n"
        )
    }

    fn collect(dedup: &mut SseDedup, input: &str) -> String {
        let mut out = Vec::new();
        out.extend(dedup.push(input.as_bytes()));
        if let Some(rest) = dedup.finish() {
            out.push(rest);
        }
        out.iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect()
    }

    #[test]
    fn drops_adjacent_duplicate_deltas() {
        let input = format!(
            "{}{}{}data: [DONE]\n\n",
            delta_event("hello"),
            delta_event("hello"),
            delta_event("world")
        );
        let mut dedup = SseDedup::new();
        let emitted = collect(&mut dedup, &input);
        assert_eq!(emitted.matches("hello").count(), 1);
        assert_eq!(emitted.matches("world").count(), 1);
        assert!(emitted.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn non_adjacent_repeats_survive() {
        let input = format!(
            "{}{}{}",
            delta_event("a"),
            delta_event("b"),
            delta_event("a")
        );
        let mut dedup = SseDedup::new();
        let emitted = collect(&mut dedup, &input);
        assert_eq!(emitted.matches("\"content\":\"a\"").count(), 2);
    }

    #[test]
    fn events_split_across_chunks_reassemble() {
        let event = delta_event("split");
        let (left, right) = event.split_at(10);
        let mut dedup = SseDedup::new();
        assert!(dedup.push(left.as_bytes()).is_empty());
        let out = dedup.push(right.as_bytes());
        assert_eq!(out.len(), 1);
        assert_eq!(String::from_utf8_lossy(&out[0]), event);
    }

    #[test]
    fn unparseable_events_pass_through() {
        let input = "data: {not json}\n\ndata: {not json}\n\n";
        let mut dedup = SseDedup::new();
        let out = dedup.push(input.as_bytes());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn trailing_bytes_are_flushed() {
        let mut dedup = SseDedup::new();
        assert!(dedup.push(b"data: {\"choices\"").is_empty());
        let rest = dedup.finish().unwrap();
        assert_eq!(&rest[..], b"data: {\"choices\"" as &[u8]);
    }

    #[tokio::test]
    async fn stream_adapter_preserves_order() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(4);
        let mut deduped = dedup_stream(rx);

        tx.send(Bytes::from(delta_event("hello"))).await.unwrap();
        tx.send(Bytes::from(delta_event("hello"))).await.unwrap();
        tx.send(Bytes::from(delta_event("world"))).await.unwrap();
        tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(chunk) = deduped.recv().await {
            seen.push(String::from_utf8_lossy(&chunk).to_string());
        }
        assert_eq!(seen.len(), 3);
        assert!(seen[0].contains("hello"));
        assert!(seen[1].contains("world"));
        assert_eq!(seen[2], "data: [DONE]\n\n");
    }
}
