//! Stateful parser for the upstream event stream.
//!
//! The upstream wraps JSON payloads in a binary event framing. Rather than
//! decode the framing, the parser keeps a sliding UTF-8 window over the raw
//! bytes and recovers well-formed JSON objects around known key markers,
//! tolerating partial reads, escape sequences inside string literals, and
//! framing bytes between payloads. Recovered objects are classified into
//! [`StreamEvent`]s for the transcoder.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tracing::{debug, warn};

use kiro_core::ids;

/// Events handed to the transcoder, in upstream order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text delta, escape sequences already decoded.
    Content { text: String },
    ToolStart { id: String, name: String },
    /// JSON fragment of the tool input; concatenated per id.
    ToolInput { id: String, text: String },
    /// The input for `id` is complete and JSON-parseable.
    ToolStop { id: String },
    ContextUsage { percent: f64 },
    Usage { credits: f64 },
    /// Stream closed cleanly.
    End,
}

/// A fully assembled tool call, used for cross-source deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON text of the input.
    pub input: String,
}

const MARKER_CONTENT: &str = "\"content\":";
const MARKER_TOOL_USE: &str = "\"toolUseId\":";
const MARKER_CONTEXT_USAGE: &str = "\"contextUsagePercentage\"";
const MARKER_CREDITS: &str = "\"creditsUsed\"";

const MARKERS: &[&str] = &[
    MARKER_CONTENT,
    MARKER_TOOL_USE,
    MARKER_CONTEXT_USAGE,
    MARKER_CREDITS,
];

/// How much marker-free window tail survives a trim. Generous enough that an
/// object whose marker key hasn't streamed in yet keeps its opening brace.
const TAIL_KEEP: usize = 8192;

/// Find the `}` matching the `{` at `start`, honoring string literals and
/// backslash escapes. Returns `None` when `text` ends before the region
/// closes (or `start` is not an opening brace).
pub fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone)]
struct OpenToolCall {
    id: String,
    name: String,
    input: String,
    stopped: bool,
}

/// One instance per upstream response.
pub struct EventStreamParser {
    /// Raw bytes not yet decodable as UTF-8 (partial trailing char).
    raw: Vec<u8>,
    /// Decoded sliding window the markers are searched in.
    window: String,
    last_content_hash: Option<u64>,
    open_tools: Vec<OpenToolCall>,
    tool_index_by_id: HashMap<String, usize>,
    /// Accumulated plain text, kept for the post-hoc bracket scan.
    content: String,
    context_usage_percent: Option<f64>,
    credits_used: Option<f64>,
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self {
            raw: Vec::new(),
            window: String::new(),
            last_content_hash: None,
            open_tools: Vec::new(),
            tool_index_by_id: HashMap::new(),
            content: String::new(),
            context_usage_percent: None,
            credits_used: None,
        }
    }

    pub fn context_usage_percent(&self) -> Option<f64> {
        self.context_usage_percent
    }

    pub fn credits_used(&self) -> Option<f64> {
        self.credits_used
    }

    /// Accumulated assistant text; after [`finish`](Self::finish) the
    /// recognized bracket-call regions have been subtracted.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Feed one chunk of upstream bytes, returning the events it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.raw.extend_from_slice(bytes);
        self.drain_utf8();
        self.scan()
    }

    /// Move every complete UTF-8 prefix of `raw` into the window. Invalid
    /// bytes (binary framing) become replacement chars; an incomplete
    /// trailing char stays buffered.
    fn drain_utf8(&mut self) {
        loop {
            match std::str::from_utf8(&self.raw) {
                Ok(s) => {
                    self.window.push_str(s);
                    self.raw.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.window
                        .push_str(&String::from_utf8_lossy(&self.raw[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            self.window.push('\u{FFFD}');
                            self.raw.drain(..valid + bad);
                        }
                        None => {
                            self.raw.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn scan(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut cursor = 0usize;

        loop {
            let Some((marker_pos, marker_len)) = next_marker(&self.window, cursor) else {
                self.trim_window(cursor);
                return events;
            };

            // Walk '{' candidates backward from the marker; the payload is
            // the nearest object that spans it.
            let mut spanning: Option<(usize, usize)> = None;
            let mut unmatched: Option<usize> = None;
            let region = &self.window[cursor..marker_pos];
            for (off, _) in region.match_indices('{').collect::<Vec<_>>().into_iter().rev() {
                let open = cursor + off;
                match find_matching_brace(&self.window, open) {
                    Some(close) if close > marker_pos => {
                        spanning = Some((open, close));
                        break;
                    }
                    // Closes before the marker: a sibling or nested object.
                    Some(_) => {}
                    // Unclosed so far; the leftmost such brace is where a
                    // still-streaming payload would begin.
                    None => unmatched = Some(open),
                }
            }

            match (spanning, unmatched) {
                (Some((open, close)), _) => {
                    let slice = &self.window[open..=close];
                    match serde_json::from_str::<serde_json::Value>(slice) {
                        Ok(value) => {
                            self.classify(&value, &mut events);
                            cursor = close + 1;
                        }
                        Err(_) => {
                            // Marker embedded in framing junk; skip past it.
                            cursor = marker_pos + marker_len;
                        }
                    }
                }
                (None, Some(open)) => {
                    // Incomplete payload: retain from its opening brace and
                    // wait for more bytes.
                    self.window.drain(..open);
                    return events;
                }
                (None, None) => {
                    cursor = marker_pos + marker_len;
                }
            }
        }
    }

    /// Drop the consumed prefix and cap the marker-free tail.
    fn trim_window(&mut self, cursor: usize) {
        let mut keep_from = cursor;
        if self.window.len() - keep_from > TAIL_KEEP {
            keep_from = self.window.len() - TAIL_KEEP;
        }
        while !self.window.is_char_boundary(keep_from) {
            keep_from -= 1;
        }
        self.window.drain(..keep_from);
    }

    fn classify(&mut self, value: &serde_json::Value, events: &mut Vec<StreamEvent>) {
        let Some(obj) = value.as_object() else {
            return;
        };

        if obj.contains_key("toolUseId") {
            self.classify_tool_use(obj, events);
            return;
        }

        let mut non_content = false;
        if let Some(percent) = obj.get("contextUsagePercentage").and_then(|v| v.as_f64()) {
            self.context_usage_percent = Some(percent);
            events.push(StreamEvent::ContextUsage { percent });
            non_content = true;
        }
        if let Some(credits) = obj.get("creditsUsed").and_then(|v| v.as_f64()) {
            self.credits_used = Some(credits);
            events.push(StreamEvent::Usage { credits });
            non_content = true;
        }
        if non_content {
            self.last_content_hash = None;
            return;
        }

        if let Some(text) = obj.get("content").and_then(|v| v.as_str()) {
            if text.is_empty() {
                return;
            }
            let hash = hash_text(text);
            if self.last_content_hash == Some(hash) {
                debug!(len = text.len(), "dropping duplicated content delta");
                return;
            }
            self.last_content_hash = Some(hash);
            self.content.push_str(text);
            events.push(StreamEvent::Content {
                text: text.to_string(),
            });
        }
    }

    fn classify_tool_use(
        &mut self,
        obj: &serde_json::Map<String, serde_json::Value>,
        events: &mut Vec<StreamEvent>,
    ) {
        self.last_content_hash = None;

        let id = obj
            .get("toolUseId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            warn!("tool use event without toolUseId");
            return;
        }

        if !self.tool_index_by_id.contains_key(&id) {
            let name = obj
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            self.tool_index_by_id
                .insert(id.clone(), self.open_tools.len());
            self.open_tools.push(OpenToolCall {
                id: id.clone(),
                name: name.clone(),
                input: String::new(),
                stopped: false,
            });
            events.push(StreamEvent::ToolStart {
                id: id.clone(),
                name,
            });
        }
        let index = self.tool_index_by_id[&id];

        if let Some(fragment) = obj.get("input").and_then(|v| v.as_str()) {
            if !fragment.is_empty() {
                self.open_tools[index].input.push_str(fragment);
                events.push(StreamEvent::ToolInput {
                    id: id.clone(),
                    text: fragment.to_string(),
                });
            }
        }

        if obj.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
            self.open_tools[index].stopped = true;
            events.push(StreamEvent::ToolStop { id });
        }
    }

    /// Close the stream: recover bracket-style tool calls from the text
    /// accumulator, drop duplicates of structured calls, and emit the
    /// synthesized triples followed by `End`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        let (bracket_calls, cleaned) = extract_bracket_tool_calls(&self.content);
        self.content = cleaned;

        let structured: Vec<CompletedToolCall> = self
            .open_tools
            .iter()
            .map(|t| CompletedToolCall {
                id: t.id.clone(),
                name: t.name.clone(),
                input: t.input.clone(),
            })
            .collect();
        let structured_ids: Vec<String> = structured.iter().map(|c| c.id.clone()).collect();

        let mut all = structured;
        all.extend(bracket_calls.into_iter().map(|(name, input)| {
            CompletedToolCall {
                id: ids::tool_call_id(),
                name,
                input,
            }
        }));
        let deduped = deduplicate_tool_calls(all);

        // Structured calls were already emitted live; only the surviving
        // bracket extractions are synthesized here.
        for call in deduped
            .into_iter()
            .filter(|c| !structured_ids.contains(&c.id))
        {
            events.push(StreamEvent::ToolStart {
                id: call.id.clone(),
                name: call.name,
            });
            events.push(StreamEvent::ToolInput {
                id: call.id.clone(),
                text: call.input,
            });
            events.push(StreamEvent::ToolStop { id: call.id });
        }

        events.push(StreamEvent::End);
        events
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

fn next_marker(window: &str, from: usize) -> Option<(usize, usize)> {
    MARKERS
        .iter()
        .filter_map(|m| window[from..].find(m).map(|i| (from + i, m.len())))
        .min_by_key(|&(pos, _)| pos)
}

/// Canonical form of a tool input for equality: parsed-and-reserialized JSON
/// when possible, trimmed raw text otherwise.
fn canonical_input(input: &str) -> String {
    serde_json::from_str::<serde_json::Value>(input)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| input.trim().to_string())
}

/// Remove tool calls whose `(name, canonical(input))` was already seen,
/// keeping the first occurrence.
pub fn deduplicate_tool_calls(calls: Vec<CompletedToolCall>) -> Vec<CompletedToolCall> {
    let mut seen: Vec<(String, String)> = Vec::new();
    let mut kept = Vec::with_capacity(calls.len());
    for call in calls {
        let key = (call.name.clone(), canonical_input(&call.input));
        if seen.contains(&key) {
            debug!(tool = %call.name, "dropping duplicate tool call");
            continue;
        }
        seen.push(key);
        kept.push(call);
    }
    kept
}

/// Scan `text` for inline `[Called name with args: {…}]` regions. Returns
/// the extracted `(name, input_json)` pairs and the text with those regions
/// removed.
pub fn extract_bracket_tool_calls(text: &str) -> (Vec<(String, String)>, String) {
    let mut calls = Vec::new();
    let mut cleaned = String::with_capacity(text.len());
    let mut pos = 0usize;

    const LEAD: &str = "[Called ";
    while let Some(found) = text[pos..].find(LEAD) {
        let start = pos + found;
        match parse_bracket_call(text, start) {
            Some((name, input, end)) => {
                cleaned.push_str(&text[pos..start]);
                calls.push((name, input));
                pos = end;
            }
            None => {
                cleaned.push_str(&text[pos..start + LEAD.len()]);
                pos = start + LEAD.len();
            }
        }
    }
    cleaned.push_str(&text[pos..]);

    (calls, cleaned)
}

/// Parse one bracket call beginning at `start` (which points at `[Called `).
/// Returns `(name, input_json, end_exclusive)`.
fn parse_bracket_call(text: &str, start: usize) -> Option<(String, String, usize)> {
    let head_start = start + "[Called ".len();
    let rest = &text[head_start..];

    let colon = rest.find(':')?;
    let head = &rest[..colon];
    if head.is_empty() || head.contains(['{', ']', '[', '\n']) {
        return None;
    }
    let name = head.strip_suffix(" with args").unwrap_or(head).trim();
    if name.is_empty() {
        return None;
    }

    let bytes = text.as_bytes();
    let mut brace = head_start + colon + 1;
    while bytes.get(brace) == Some(&b' ') {
        brace += 1;
    }
    if bytes.get(brace) != Some(&b'{') {
        return None;
    }
    let close = find_matching_brace(text, brace)?;
    if bytes.get(close + 1) != Some(&b']') {
        return None;
    }

    Some((name.to_string(), text[brace..=close].to_string(), close + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── find_matching_brace ──────────────────────────────────────────────────

    #[test]
    fn brace_matcher_handles_nesting() {
        let s = r#"{"a":{"b":{"c":1}},"d":2}"#;
        assert_eq!(find_matching_brace(s, 0), Some(s.len() - 1));
        assert_eq!(find_matching_brace(s, 5), Some(17));
    }

    #[test]
    fn brace_matcher_ignores_braces_in_strings() {
        let s = r#"{"text":"closing } and opening { inside"}"#;
        assert_eq!(find_matching_brace(s, 0), Some(s.len() - 1));
    }

    #[test]
    fn brace_matcher_honors_escaped_quotes() {
        let s = r#"{"text":"a \" quote and \\","n":1}"#;
        assert_eq!(find_matching_brace(s, 0), Some(s.len() - 1));
    }

    #[test]
    fn brace_matcher_incomplete_region_returns_none() {
        assert_eq!(find_matching_brace(r#"{"a":{"b":1}"#, 0), None);
        assert_eq!(find_matching_brace("no brace here", 0), None);
    }

    // ── event extraction ─────────────────────────────────────────────────────

    fn all_events(parser: &mut EventStreamParser, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = parser.push(bytes);
        events.extend(parser.finish());
        events
    }

    #[test]
    fn content_event_from_embedded_json() {
        let mut parser = EventStreamParser::new();
        let events = all_events(&mut parser, br#"junk{"content":"Hello"}junk"#);
        assert_eq!(
            events,
            vec![
                StreamEvent::Content {
                    text: "Hello".into()
                },
                StreamEvent::End,
            ]
        );
    }

    #[test]
    fn content_survives_split_reads() {
        let mut parser = EventStreamParser::new();
        assert!(parser.push(br#"{"cont"#).is_empty());
        assert!(parser.push(br#"ent":"Hel"#).is_empty());
        let events = parser.push(br#"lo"}"#);
        assert_eq!(
            events,
            vec![StreamEvent::Content {
                text: "Hello".into()
            }]
        );
    }

    #[test]
    fn escape_sequences_are_decoded() {
        let mut parser = EventStreamParser::new();
        let events = parser.push(r#"{"content":"line\nnext \"quoted\" é"}"#.as_bytes());
        assert_eq!(
            events,
            vec![StreamEvent::Content {
                text: "line\nnext \"quoted\" é".into()
            }]
        );
    }

    #[test]
    fn adjacent_duplicate_content_is_dropped() {
        let mut parser = EventStreamParser::new();
        let events = parser.push(br#"{"content":"Hi"}{"content":"Hi"}{"content":"Hi again"}"#);
        assert_eq!(
            events,
            vec![
                StreamEvent::Content { text: "Hi".into() },
                StreamEvent::Content {
                    text: "Hi again".into()
                },
            ]
        );
    }

    #[test]
    fn duplicate_content_separated_by_other_event_is_kept() {
        let mut parser = EventStreamParser::new();
        let events = parser.push(
            br#"{"content":"Hi"}{"toolUseId":"u1","name":"f","stop":true}{"content":"Hi"}"#,
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Content { text: "Hi".into() },
                StreamEvent::ToolStart {
                    id: "u1".into(),
                    name: "f".into()
                },
                StreamEvent::ToolStop { id: "u1".into() },
                StreamEvent::Content { text: "Hi".into() },
            ]
        );
    }

    #[test]
    fn tool_use_fragments_accumulate_by_id() {
        let mut parser = EventStreamParser::new();
        let mut events =
            parser.push(br#"{"toolUseId":"u1","name":"get_weather","input":"{\"loc\""}"#);
        events.extend(parser.push(br#"{"toolUseId":"u1","input":":\"NYC\"}","stop":true}"#));
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolStart {
                    id: "u1".into(),
                    name: "get_weather".into()
                },
                StreamEvent::ToolInput {
                    id: "u1".into(),
                    text: "{\"loc\"".into()
                },
                StreamEvent::ToolInput {
                    id: "u1".into(),
                    text: ":\"NYC\"}".into()
                },
                StreamEvent::ToolStop { id: "u1".into() },
            ]
        );
    }

    #[test]
    fn usage_and_context_events() {
        let mut parser = EventStreamParser::new();
        let events = parser.push(
            br#"{"conversationId":"c","contextUsagePercentage":12.5}{"creditsUsed":0.7}"#,
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::ContextUsage { percent: 12.5 },
                StreamEvent::Usage { credits: 0.7 },
            ]
        );
        assert_eq!(parser.context_usage_percent(), Some(12.5));
        assert_eq!(parser.credits_used(), Some(0.7));
    }

    #[test]
    fn binary_framing_between_payloads_is_skipped() {
        let mut parser = EventStreamParser::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x00, 0x00, 0x01, 0x4a, 0xff, 0xfe]);
        bytes.extend_from_slice(br#"{"content":"A"}"#);
        bytes.extend_from_slice(&[0x0b, b':', b'e', b'v', 0x80]);
        bytes.extend_from_slice(br#"{"content":"B"}"#);
        let events = parser.push(&bytes);
        assert_eq!(
            events,
            vec![
                StreamEvent::Content { text: "A".into() },
                StreamEvent::Content { text: "B".into() },
            ]
        );
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let payload = r#"{"content":"héllo"}"#.as_bytes();
        let mut parser = EventStreamParser::new();
        // split inside the two-byte é
        let split = payload.iter().position(|&b| b == 0xc3).unwrap() + 1;
        let mut events = parser.push(&payload[..split]);
        events.extend(parser.push(&payload[split..]));
        assert_eq!(
            events,
            vec![StreamEvent::Content {
                text: "héllo".into()
            }]
        );
    }

    // ── bracket-style tool calls ─────────────────────────────────────────────

    #[test]
    fn bracket_call_with_args_is_extracted_and_removed() {
        let (calls, cleaned) =
            extract_bracket_tool_calls(r#"before [Called get_weather with args: {"loc":"NYC"}] after"#);
        assert_eq!(
            calls,
            vec![("get_weather".to_string(), r#"{"loc":"NYC"}"#.to_string())]
        );
        assert_eq!(cleaned, "before  after");
    }

    #[test]
    fn bracket_call_without_args_suffix() {
        let (calls, cleaned) = extract_bracket_tool_calls(r#"[Called list_files: {"path":"/"}]"#);
        assert_eq!(calls, vec![("list_files".to_string(), r#"{"path":"/"}"#.to_string())]);
        assert!(cleaned.is_empty());
    }

    #[test]
    fn bracket_call_with_nested_braces_and_strings() {
        let text = r#"[Called f with args: {"a":{"b":"}"},"c":1}]"#;
        let (calls, _) = extract_bracket_tool_calls(text);
        assert_eq!(calls[0].1, r#"{"a":{"b":"}"},"c":1}"#);
    }

    #[test]
    fn unterminated_bracket_call_is_left_alone() {
        let text = r#"[Called f with args: {"a":1"#;
        let (calls, cleaned) = extract_bracket_tool_calls(text);
        assert!(calls.is_empty());
        assert_eq!(cleaned, text);
    }

    #[test]
    fn finish_synthesizes_bracket_calls() {
        let mut parser = EventStreamParser::new();
        parser.push(br#"{"content":"I will check. [Called get_weather with args: {\"loc\":\"NYC\"}]"}"#);
        let events = parser.finish();
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[0],
            StreamEvent::ToolStart { name, .. } if name == "get_weather"
        ));
        assert!(matches!(
            &events[1],
            StreamEvent::ToolInput { text, .. } if text == r#"{"loc":"NYC"}"#
        ));
        assert!(matches!(&events[2], StreamEvent::ToolStop { .. }));
        assert_eq!(events[3], StreamEvent::End);
        // the matched region is subtracted from the accumulated content
        assert_eq!(parser.content(), "I will check. ");
    }

    #[test]
    fn structured_and_bracket_duplicates_collapse() {
        let mut parser = EventStreamParser::new();
        parser.push(
            br#"{"toolUseId":"u1","name":"get_weather","input":"{\"loc\":\"NYC\"}","stop":true}"#,
        );
        parser.push(br#"{"content":"[Called get_weather with args: {\"loc\": \"NYC\"}]"}"#);
        let events = parser.finish();
        // bracket duplicate dropped: only End remains
        assert_eq!(events, vec![StreamEvent::End]);
    }

    #[test]
    fn distinct_bracket_call_survives_dedup() {
        let mut parser = EventStreamParser::new();
        parser.push(
            br#"{"toolUseId":"u1","name":"get_weather","input":"{\"loc\":\"NYC\"}","stop":true}"#,
        );
        parser.push(br#"{"content":"[Called get_weather with args: {\"loc\":\"LA\"}]"}"#);
        let events = parser.finish();
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[1],
            StreamEvent::ToolInput { text, .. } if text == r#"{"loc":"LA"}"#
        ));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let calls = vec![
            CompletedToolCall {
                id: "a".into(),
                name: "f".into(),
                input: r#"{"x": 1}"#.into(),
            },
            CompletedToolCall {
                id: "b".into(),
                name: "f".into(),
                input: r#"{"x":1}"#.into(),
            },
            CompletedToolCall {
                id: "c".into(),
                name: "g".into(),
                input: r#"{"x":1}"#.into(),
            },
        ];
        let kept = deduplicate_tool_calls(calls);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, "a");
        assert_eq!(kept[1].id, "c");
    }
}
