use crate::types::{ConsensusSuggestion, ReviewEvent, Summary, Verdict};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

const CONFIDENCE_PRECISION: usize = 2;

/// Consumer-side view of a session, rebuilt from its event stream
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    /// Visible suggestions in first-added order, updates applied in place
    pub suggestions: Vec<ConsensusSuggestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Provider id to error message
    pub provider_errors: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    /// When the terminal event arrived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Feed {
    pub fn apply(&mut self, event: &ReviewEvent) {
        match event {
            ReviewEvent::SuggestionAdded(suggestion) => {
                self.suggestions.push(suggestion.clone());
            }
            ReviewEvent::SuggestionUpdated { id, suggestion } => {
                if let Some(existing) = self.suggestions.iter_mut().find(|s| s.id() == id) {
                    *existing = suggestion.clone();
                }
            }
            ReviewEvent::Summary(summary) => self.summary = Some(summary.clone()),
            ReviewEvent::ProviderError { id, message } => {
                self.provider_errors.insert(id.clone(), message.clone());
            }
            ReviewEvent::Complete {
                summary_text,
                verdict,
            } => {
                self.summary_text = Some(summary_text.clone());
                self.verdict = Some(*verdict);
                self.completed_at = Some(Utc::now());
            }
            ReviewEvent::FatalError { message } => {
                self.fatal_error = Some(message.clone());
                self.completed_at = Some(Utc::now());
            }
            ReviewEvent::ProviderStarted { .. } | ReviewEvent::ProviderCompleted { .. } => {}
        }
    }

    pub fn is_complete(&self) -> bool {
        self.verdict.is_some() || self.fatal_error.is_some()
    }
}

/// Render the consensus feed as Markdown, grouped by file in first-seen order
pub fn format_feed(feed: &Feed) -> String {
    let mut output = String::new();

    if let Some(message) = &feed.fatal_error {
        output.push_str(&format!("**Review failed:** {}\n", message));
        return output;
    }

    output.push_str("# Review\n\n");
    if let Some(verdict) = feed.verdict {
        output.push_str(&format!("**Verdict:** {}\n\n", verdict));
    }
    let summary_text = feed
        .summary_text
        .as_deref()
        .or(feed.summary.as_ref().map(|s| s.text.as_str()));
    if let Some(text) = summary_text {
        output.push_str(&format!("{}\n\n", text.trim()));
    }
    if let Some(summary) = &feed.summary {
        if !summary.key_changes.is_empty() {
            output.push_str("## Key changes\n\n");
            for change in &summary.key_changes {
                output.push_str(&format!("- {}\n", change));
            }
            output.push('\n');
        }
    }

    if feed.suggestions.is_empty() {
        output.push_str("No suggestions\n");
    } else {
        let mut files: Vec<&str> = Vec::new();
        for suggestion in &feed.suggestions {
            if !files.contains(&suggestion.suggestion.file_path.as_str()) {
                files.push(&suggestion.suggestion.file_path);
            }
        }
        for file in files {
            output.push_str(&format!("## {}\n\n", file));
            for item in feed
                .suggestions
                .iter()
                .filter(|s| s.suggestion.file_path == file)
            {
                output.push_str(&format_suggestion(item));
            }
        }
    }

    if !feed.provider_errors.is_empty() {
        output.push_str("## Provider errors\n\n");
        for (id, message) in &feed.provider_errors {
            output.push_str(&format!("- {}: {}\n", id, message));
        }
    }
    output.trim_end().to_string()
}

fn format_suggestion(item: &ConsensusSuggestion) -> String {
    let s = &item.suggestion;
    let lines = match s.line_range {
        Some(range) => format!("Lines {}-{}", range.start, range.end),
        None => format!("Line {}", s.line_number),
    };
    let providers: Vec<&str> = item
        .contributing_providers
        .iter()
        .map(String::as_str)
        .collect();

    let mut output = format!(
        "- {} [{:?}/{:?}]: {}\n  Confidence {:.prec$} ({:?}) from {}\n",
        lines,
        s.priority,
        s.category,
        s.description.trim(),
        item.confidence,
        item.confidence_level,
        providers.join(", "),
        prec = CONFIDENCE_PRECISION
    );
    // Fence and body share the list item's indent
    if let Some(code) = &s.suggested_code {
        let backticks = get_fence_backticks(code);
        output.push_str(&format!("\n  {}\n", backticks));
        for line in code.trim_end().lines() {
            if line.is_empty() {
                output.push('\n');
            } else {
                output.push_str(&format!("  {}\n", line));
            }
        }
        output.push_str(&format!("  {}\n", backticks));
    }
    output.push('\n');
    output
}

/// One human-readable log line per event
pub fn describe_event(event: &ReviewEvent) -> String {
    match event {
        ReviewEvent::ProviderStarted { id } => format!("[Provider {}] started", id),
        ReviewEvent::ProviderCompleted { id, count } => {
            format!("[Provider {}] completed with {} suggestions", id, count)
        }
        ReviewEvent::ProviderError { id, message } => format!("[Provider {}] error: {}", id, message),
        ReviewEvent::Summary(summary) => format!("Summary: {}", summary.text),
        ReviewEvent::SuggestionAdded(s) => format!(
            "+ {}:{} {} ({} providers)",
            s.suggestion.file_path,
            s.suggestion.line_number,
            s.suggestion.description,
            s.provider_count
        ),
        ReviewEvent::SuggestionUpdated { id, suggestion } => format!(
            "~ {} now backed by {} providers, confidence {:.prec$}",
            id,
            suggestion.provider_count,
            suggestion.confidence,
            prec = CONFIDENCE_PRECISION
        ),
        ReviewEvent::Complete { verdict, .. } => format!("Review complete: {}", verdict),
        ReviewEvent::FatalError { message } => format!("Review failed: {}", message),
    }
}

/// Get appropriate number of backticks for Markdown code fence
/// Returns at least 3 backticks, or more if content contains backtick sequences
pub(crate) fn get_fence_backticks(content: &str) -> String {
    const MIN_BACKTICKS: usize = 3;
    let max_backticks = content
        .as_bytes()
        .split(|&b| b != b'`')
        .filter(|s| !s.is_empty())
        .map(|s| s.len())
        .max()
        .unwrap_or(0);
    "`".repeat((max_backticks + 1).max(MIN_BACKTICKS))
}
