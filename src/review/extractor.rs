use crate::types::{
    Category, LineRange, Priority, ProviderId, Suggestion, SuggestionKind, Summary, Verdict,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

const SUGGESTIONS_KEY: &str = "\"suggestions\"";
/// Consecutive digits within one chunk treated as runaway numeric generation
const MAX_DIGIT_RUN: usize = 15;
/// Number of trailing identical chunks treated as degenerate repetition
const REPETITION_WINDOW: usize = 20;
/// Characters of a repeated chunk quoted in the abort reason
const REASON_PREVIEW_CHARS: usize = 40;

/// Session-wide counter behind suggestion ids (`<provider>-<n>`)
#[derive(Debug, Clone, Default)]
pub struct IdSequence(Arc<AtomicU64>);

impl IdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self, provider: &str) -> String {
        let n = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", provider, n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Looking for the literal `"suggestions"` key
    SeekingKey,
    /// Key found, looking for the `[` that opens the array
    SeekingArray { from: usize },
    /// Array located; objects are re-scanned from `array_start` on every chunk
    Scanning { array_start: usize },
}

/// Brace/quote tracking while walking the suggestions array
#[derive(Debug, Default)]
struct ObjectScanner {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

/// Byte spans of the complete top-level objects in `region`, stopping at the
/// array's closing bracket.
fn complete_objects(region: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut scanner = ObjectScanner::default();
    let mut start = 0;

    for (i, &b) in region.as_bytes().iter().enumerate() {
        if scanner.in_string {
            if scanner.escaped {
                scanner.escaped = false;
            } else if b == b'\\' {
                scanner.escaped = true;
            } else if b == b'"' {
                scanner.in_string = false;
            }
            continue;
        }

        match b {
            b'"' => scanner.in_string = true,
            b'{' => {
                if scanner.depth == 0 {
                    start = i;
                }
                scanner.depth += 1;
            }
            b'}' if scanner.depth > 0 => {
                scanner.depth -= 1;
                if scanner.depth == 0 {
                    spans.push((start, i + 1));
                }
            }
            b']' if scanner.depth == 0 => break,
            _ => {}
        }
    }

    spans
}

fn longest_digit_run(chunk: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for c in chunk.chars() {
        if c.is_ascii_digit() {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

/// Incremental parser turning one provider's token stream into suggestions
///
/// Each chunk is appended to a buffer and the `suggestions` array is re-scanned
/// from its opening bracket. Complete objects beyond the ones already resolved
/// are parsed and handed to `on_suggestion`, so every object is emitted at most
/// once whatever the chunk boundaries. Degenerate output (long digit runs,
/// identical repeated chunks) trips `on_error` once and stops the extractor.
pub struct StreamExtractor<S, E>
where
    S: FnMut(Suggestion),
    E: FnMut(&str),
{
    provider_id: ProviderId,
    ids: IdSequence,
    buffer: String,
    state: ScanState,
    resolved: usize,
    emitted: usize,
    recent_chunks: VecDeque<String>,
    abort_reason: Option<String>,
    on_suggestion: S,
    on_error: E,
}

impl<S, E> StreamExtractor<S, E>
where
    S: FnMut(Suggestion),
    E: FnMut(&str),
{
    pub fn new(provider_id: &str, ids: IdSequence, on_suggestion: S, on_error: E) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            ids,
            buffer: String::new(),
            state: ScanState::SeekingKey,
            resolved: 0,
            emitted: 0,
            recent_chunks: VecDeque::with_capacity(REPETITION_WINDOW + 1),
            abort_reason: None,
            on_suggestion,
            on_error,
        }
    }

    /// Feed one chunk. Returns `false` when the stream must be aborted.
    pub fn process(&mut self, chunk: &str) -> bool {
        if self.abort_reason.is_some() {
            return false;
        }

        if let Some(reason) = self.detect_hallucination(chunk) {
            warn!("[Provider {}] Aborting stream: {}", self.provider_id, reason);
            (self.on_error)(&reason);
            self.abort_reason = Some(reason);
            return false;
        }

        self.buffer.push_str(chunk);
        self.extract();
        true
    }

    /// Everything received so far
    pub fn final_text(&self) -> &str {
        &self.buffer
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    fn detect_hallucination(&mut self, chunk: &str) -> Option<String> {
        let digits = longest_digit_run(chunk);
        if digits >= MAX_DIGIT_RUN {
            return Some(format!(
                "runaway numeric output ({} consecutive digits)",
                digits
            ));
        }

        self.recent_chunks.push_back(chunk.to_string());
        if self.recent_chunks.len() > REPETITION_WINDOW {
            self.recent_chunks.pop_front();
        }

        if !chunk.is_empty()
            && self.recent_chunks.len() == REPETITION_WINDOW
            && self.recent_chunks.iter().all(|c| c == chunk)
        {
            let preview: String = chunk.chars().take(REASON_PREVIEW_CHARS).collect();
            return Some(format!(
                "degenerate repetition ({} identical chunks of {:?})",
                REPETITION_WINDOW, preview
            ));
        }

        None
    }

    fn extract(&mut self) {
        loop {
            match self.state {
                ScanState::SeekingKey => match self.buffer.find(SUGGESTIONS_KEY) {
                    Some(pos) => {
                        trace!("[Provider {}] Found suggestions key", self.provider_id);
                        self.state = ScanState::SeekingArray {
                            from: pos + SUGGESTIONS_KEY.len(),
                        };
                    }
                    None => return,
                },
                ScanState::SeekingArray { from } => match self.buffer[from..].find('[') {
                    Some(pos) => {
                        self.state = ScanState::Scanning {
                            array_start: from + pos + 1,
                        };
                    }
                    None => return,
                },
                ScanState::Scanning { array_start } => {
                    self.scan_objects(array_start);
                    return;
                }
            }
        }
    }

    fn scan_objects(&mut self, array_start: usize) {
        let region = &self.buffer[array_start..];

        for (index, (start, end)) in complete_objects(region).into_iter().enumerate() {
            let ordinal = index + 1;
            if ordinal <= self.resolved {
                continue;
            }

            let fragment = &region[start..end];
            let raw = match serde_json::from_str::<RawSuggestion>(fragment) {
                Ok(raw) => raw,
                Err(e) => {
                    // Retried on the next chunk; a later object resolving first skips it
                    trace!(
                        "[Provider {}] Object {} not parseable yet: {}",
                        self.provider_id, ordinal, e
                    );
                    continue;
                }
            };
            self.resolved = ordinal;

            match raw.into_suggestion(&self.provider_id) {
                Some(mut suggestion) => {
                    suggestion.id = self.ids.next_id(&self.provider_id);
                    debug!(
                        "[Provider {}] Extracted suggestion {} at {}:{}",
                        self.provider_id,
                        suggestion.id,
                        suggestion.file_path,
                        suggestion.line_number
                    );
                    self.emitted += 1;
                    (self.on_suggestion)(suggestion);
                }
                None => trace!(
                    "[Provider {}] Dropping object {} without filePath or description",
                    self.provider_id, ordinal
                ),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSuggestion {
    #[serde(default, alias = "file", alias = "file_path", alias = "path")]
    file_path: Option<String>,
    #[serde(default, alias = "line", alias = "line_number")]
    line_number: Option<Value>,
    #[serde(default, alias = "line_range")]
    line_range: Option<RawLineRange>,
    #[serde(default)]
    priority: Option<Value>,
    #[serde(default, alias = "type")]
    kind: Option<Value>,
    #[serde(default, alias = "message", alias = "comment")]
    description: Option<String>,
    #[serde(default, alias = "suggested_code")]
    suggested_code: Option<String>,
    #[serde(default)]
    category: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawLineRange {
    start: Value,
    end: Value,
}

fn as_line(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Option<Value>) -> &str {
    value.as_ref().and_then(Value::as_str).unwrap_or_default()
}

impl RawSuggestion {
    /// `None` when `filePath` or `description` is missing; the id is left empty
    fn into_suggestion(self, provider_id: &str) -> Option<Suggestion> {
        let file_path = self.file_path.map(|s| s.trim().to_string())?;
        let description = self.description.map(|s| s.trim().to_string())?;
        if file_path.is_empty() || description.is_empty() {
            return None;
        }

        let line_range = self.line_range.as_ref().and_then(|range| {
            let start = as_line(&range.start)?;
            let end = as_line(&range.end)?;
            Some(LineRange::new(start, end))
        });
        let line_number = self
            .line_number
            .as_ref()
            .and_then(as_line)
            .or(line_range.map(|r| r.start))
            .unwrap_or(1);

        Some(Suggestion {
            id: String::new(),
            file_path,
            line_number,
            line_range: line_range.filter(|r| r.start != r.end),
            priority: Priority::parse(as_text(&self.priority)),
            kind: SuggestionKind::parse(as_text(&self.kind)),
            description,
            suggested_code: self.suggested_code.filter(|code| !code.trim().is_empty()),
            category: Category::parse(as_text(&self.category)),
            provider_id: provider_id.to_string(),
        })
    }
}

/// Verdict and optional summary parsed from a provider's complete output
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderOutput {
    pub verdict: Verdict,
    pub summary: Option<Summary>,
}

/// Slice from the first `{` to the last `}`, tolerating code fences and prose
pub fn json_object_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSummary {
    #[serde(default, alias = "summary")]
    text: Option<String>,
    #[serde(default, alias = "key_changes")]
    key_changes: Vec<String>,
    #[serde(default)]
    concerns: Option<Vec<String>>,
}

/// Accepts either a bare string or a `{text, keyChanges, concerns}` object
pub fn summary_from_value(value: &Value) -> Option<Summary> {
    let summary = match value {
        Value::String(text) => Summary {
            text: text.trim().to_string(),
            ..Summary::default()
        },
        Value::Object(_) => {
            let raw: RawSummary = serde_json::from_value(value.clone()).ok()?;
            Summary {
                text: raw.text.unwrap_or_default().trim().to_string(),
                key_changes: raw.key_changes,
                concerns: raw.concerns.filter(|c| !c.is_empty()),
            }
        }
        _ => return None,
    };
    (!summary.text.is_empty()).then_some(summary)
}

/// Parse verdict and summary from the final text; malformed output yields `comment`
pub fn parse_final_output(text: &str) -> ProviderOutput {
    let Some(slice) = json_object_slice(text) else {
        return ProviderOutput::default();
    };
    let Ok(value) = serde_json::from_str::<Value>(slice) else {
        debug!("Final provider output is not valid JSON, defaulting verdict");
        return ProviderOutput::default();
    };

    ProviderOutput {
        verdict: value
            .get("verdict")
            .and_then(Value::as_str)
            .map(Verdict::parse)
            .unwrap_or_default(),
        summary: value.get("summary").and_then(summary_from_value),
    }
}
