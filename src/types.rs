use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identifier of an advisory provider (e.g. "openai", "local")
pub type ProviderId = String;

/// Suggestion priority, ordered `Low < Medium < High`
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Lenient parse used on provider output; unknown values become `Medium`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" | "critical" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// Whether a suggestion is a plain remark or carries replacement code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    #[default]
    Comment,
    CodeChange,
}

impl SuggestionKind {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "code_change" | "codechange" | "change" => Self::CodeChange,
            _ => Self::Comment,
        }
    }
}

/// Review category of a suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Security,
    Performance,
    Style,
    Logic,
    #[default]
    BestPractice,
    Documentation,
}

impl Category {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "security" => Self::Security,
            "performance" => Self::Performance,
            "style" => Self::Style,
            "logic" | "bug" | "correctness" => Self::Logic,
            "documentation" | "docs" => Self::Documentation,
            _ => Self::BestPractice,
        }
    }
}

/// Inclusive line range (`start <= end`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    /// Build a range, swapping the bounds if they arrive reversed
    pub fn new(start: u32, end: u32) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    pub fn midpoint(&self) -> f64 {
        (f64::from(self.start) + f64::from(self.end)) / 2.0
    }
}

/// One atomic review observation emitted by exactly one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    /// Session-unique id (`<provider>-<counter>`)
    pub id: String,
    pub file_path: String,
    /// Single-line anchor, valid even when `line_range` is set
    pub line_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_range: Option<LineRange>,
    pub priority: Priority,
    pub kind: SuggestionKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_code: Option<String>,
    pub category: Category,
    pub provider_id: ProviderId,
}

impl Suggestion {
    /// Line used for distance scoring: the range midpoint, else the anchor line
    pub fn effective_line(&self) -> f64 {
        match &self.line_range {
            Some(range) => range.midpoint(),
            None => f64::from(self.line_number),
        }
    }

    /// First and last line covered by this suggestion
    pub fn span(&self) -> (u32, u32) {
        match &self.line_range {
            Some(range) => (range.start, range.end),
            None => (self.line_number, self.line_number),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

/// Merged, confidence-scored record shown to the consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusSuggestion {
    #[serde(flatten)]
    pub suggestion: Suggestion,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub contributing_providers: BTreeSet<ProviderId>,
    pub provider_count: usize,
    /// Each contributing provider's own wording, for attribution
    pub provider_descriptions: BTreeMap<ProviderId, String>,
}

impl ConsensusSuggestion {
    pub fn id(&self) -> &str {
        &self.suggestion.id
    }
}

/// Prior human or automated discussion on the change, used for duplicate suppression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingComment {
    /// `None` for general discussion not tied to a file
    #[serde(default)]
    pub file_path: Option<String>,
    /// `None` for file-level comments
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub category: Option<Category>,
    pub summary_text: String,
    #[serde(default)]
    pub author: String,
}

/// Review verdict reported by a provider, and the aggregate session verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    RequestChanges,
    #[default]
    Comment,
}

impl Verdict {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "approve" | "approved" | "lgtm" => Self::Approve,
            "request_changes" | "changes_requested" | "reject" => Self::RequestChanges,
            _ => Self::Comment,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Approve => "approve",
            Self::RequestChanges => "request_changes",
            Self::Comment => "comment",
        };
        f.write_str(s)
    }
}

/// Change summary produced once per session (or per provider as a fallback)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub text: String,
    #[serde(default)]
    pub key_changes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concerns: Option<Vec<String>>,
}

/// Ordered event stream delivered to the consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ReviewEvent {
    ProviderStarted {
        id: ProviderId,
    },
    ProviderCompleted {
        id: ProviderId,
        count: usize,
    },
    ProviderError {
        id: ProviderId,
        message: String,
    },
    Summary(Summary),
    SuggestionAdded(ConsensusSuggestion),
    SuggestionUpdated {
        id: String,
        suggestion: ConsensusSuggestion,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        summary_text: String,
        verdict: Verdict,
    },
    FatalError {
        message: String,
    },
}

impl ReviewEvent {
    /// True for the events that end a session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::FatalError { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    Quick,
    #[default]
    Balanced,
    Thorough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusArea {
    All,
    Security,
    Performance,
    Style,
}

/// Review options shared by every provider in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default)]
    pub strictness: Strictness,
    #[serde(default = "default_focus_areas")]
    pub focus_areas: Vec<FocusArea>,
    #[serde(default)]
    pub enabled_providers: BTreeSet<ProviderId>,
}

fn default_focus_areas() -> Vec<FocusArea> {
    vec![FocusArea::All]
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            strictness: Strictness::default(),
            focus_areas: default_focus_areas(),
            enabled_providers: BTreeSet::new(),
        }
    }
}

impl ReviewConfig {
    /// An empty list is treated the same as `["all"]`
    pub fn covers_all_areas(&self) -> bool {
        self.focus_areas.is_empty() || self.focus_areas.contains(&FocusArea::All)
    }

    pub fn is_enabled(&self, provider: &str) -> bool {
        self.enabled_providers.contains(provider)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    #[default]
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Added,
    Removed,
    Context,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    pub kind: LineKind,
    #[serde(default)]
    pub old_line: Option<u32>,
    #[serde(default)]
    pub new_line: Option<u32>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Hunk {
    #[serde(default)]
    pub header: String,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    #[serde(default)]
    pub status: FileStatus,
    #[serde(default)]
    pub hunks: Vec<Hunk>,
}

/// Code change under review, supplied by the hosting-platform collaborator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub files: Vec<ChangedFile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_enum_parsing() {
        assert_eq!(Priority::parse("HIGH"), Priority::High);
        assert_eq!(Priority::parse("urgent"), Priority::Medium);
        assert_eq!(SuggestionKind::parse("code-change"), SuggestionKind::CodeChange);
        assert_eq!(Category::parse("best practice"), Category::BestPractice);
        assert_eq!(Category::parse("whatever"), Category::BestPractice);
        assert_eq!(Verdict::parse("request-changes"), Verdict::RequestChanges);
        assert_eq!(Verdict::parse(""), Verdict::Comment);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_line_range_normalizes_bounds() {
        let range = LineRange::new(12, 10);
        assert_eq!(range, LineRange { start: 10, end: 12 });
        assert_eq!(range.midpoint(), 11.0);
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = ReviewEvent::Complete {
            summary_text: "ok".into(),
            verdict: Verdict::RequestChanges,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["summaryText"], "ok");
        assert_eq!(json["verdict"], "request_changes");
    }

    #[test]
    fn test_review_config_defaults() {
        let config: ReviewConfig = toml::from_str("").unwrap();
        assert_eq!(config.strictness, Strictness::Balanced);
        assert!(config.covers_all_areas());
        assert!(!config.is_enabled("openai"));
    }
}
