//! SSE line-splitter and usage aggregation (spec §4.5, §9 "Streaming
//! read-and-forward"): bytes are relayed to the client verbatim; this
//! module is a non-destructive observer over a tee of the same stream.

use crate::pricing::Usage;

/// Accumulates a running byte buffer across chunks and yields complete
/// `data: ...` lines as they appear, without consuming/mutating the bytes
/// the caller forwards downstream.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns any complete lines that began with
    /// `data: ` (the `data: ` prefix stripped), in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = trimmed.strip_prefix("data: ") {
                out.push(data.to_string());
            } else if let Some(data) = trimmed.strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}

/// Aggregates usage across either SSE dialect. Dialect is inferred from
/// which fields actually show up on the wire.
#[derive(Debug, Default)]
pub struct UsageAggregator {
    input_tokens: u64,
    output_tokens: u64,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes one parsed `data: ` JSON payload (skip `[DONE]` and parse
    /// failures before calling this).
    pub fn observe(&mut self, event: &serde_json::Value) {
        // Anthropic: message_start carries input_tokens, message_delta carries output_tokens.
        if let Some(usage) = event.pointer("/message/usage") {
            self.input_tokens += usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        }
        if event.get("type").and_then(|v| v.as_str()) == Some("message_delta") {
            if let Some(usage) = event.get("usage") {
                self.output_tokens += usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            }
        }

        // OpenAI: the last event carrying `usage` wins outright (not summed).
        if let Some(usage) = event.get("usage") {
            if let Some(prompt) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                self.input_tokens = prompt;
                self.output_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            }
        }
    }

    pub fn finish(self) -> Usage {
        Usage { input_tokens: self.input_tokens, output_tokens: self.output_tokens }
    }
}

/// Parses one already-stripped `data: ` payload, ignoring `[DONE]` and
/// malformed JSON (spec §4.5: "ignoring [DONE] and parse errors").
pub fn parse_data_line(line: &str) -> Option<serde_json::Value> {
    if line.trim() == "[DONE]" {
        return None;
    }
    serde_json::from_str(line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splitter_yields_complete_lines_across_chunks() {
        let mut splitter = LineSplitter::new();
        let mut lines = splitter.feed(b"data: {\"a\":1}\nda");
        lines.extend(splitter.feed(b"ta: {\"b\":2}\n\n"));
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn done_sentinel_is_ignored() {
        assert!(parse_data_line("[DONE]").is_none());
    }

    #[test]
    fn anthropic_usage_aggregates_across_two_events() {
        let mut agg = UsageAggregator::new();
        agg.observe(&json!({"type": "message_start", "message": {"usage": {"input_tokens": 15}}}));
        agg.observe(&json!({"type": "message_delta", "usage": {"output_tokens": 25}}));
        let usage = agg.finish();
        assert_eq!(usage.input_tokens, 15);
        assert_eq!(usage.output_tokens, 25);
    }

    #[test]
    fn openai_usage_takes_last_event_carrying_it() {
        let mut agg = UsageAggregator::new();
        agg.observe(&json!({"choices": [{"delta": {"content": "hi"}}]}));
        agg.observe(&json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5}}));
        let usage = agg.finish();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
    }
}
