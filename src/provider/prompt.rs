use crate::review::render::get_fence_backticks;
use crate::types::{
    ChangeSet, FileStatus, FocusArea, LineKind, ReviewConfig, Strictness, Summary,
};

const REVIEW_SYSTEM_PROMPT: &str = "You are a meticulous code reviewer. \
You read a diff and report concrete, actionable problems tied to specific lines. \
You reply with a single JSON object and nothing else.";

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize code changes for reviewers. \
You reply with a single JSON object and nothing else.";

// `suggestions` must be the first key so it is streamed before any prose
const RESPONSE_FORMAT: &str = r#"{
  "suggestions": [
    {
      "filePath": "path/of/the/file",
      "lineNumber": 42,
      "lineRange": {"start": 40, "end": 44},
      "priority": "high | medium | low",
      "type": "comment | code_change",
      "category": "security | performance | style | logic | best_practice | documentation",
      "description": "What is wrong and why it matters",
      "suggestedCode": "Replacement code, only for code_change"
    }
  ],
  "verdict": "approve | request_changes | comment"SUMMARY_FIELD
}"#;

const SUMMARY_FIELD: &str = r#",
  "summary": {"text": "Two or three sentences", "keyChanges": ["..."], "concerns": ["..."]}"#;

const SUMMARY_FORMAT: &str =
    r#"{"text": "Two or three sentences", "keyChanges": ["..."], "concerns": ["..."]}"#;

fn strictness_guidance(strictness: Strictness) -> &'static str {
    match strictness {
        Strictness::Quick => {
            "Report only high-impact problems: bugs, security holes and data loss. Skip style."
        }
        Strictness::Balanced => {
            "Report bugs, security and performance issues, and notable maintainability concerns."
        }
        Strictness::Thorough => {
            "Report every issue you find, including minor style and documentation nits."
        }
    }
}

fn focus_guidance(config: &ReviewConfig) -> String {
    if config.covers_all_areas() {
        return "Cover every category.".to_string();
    }
    let areas: Vec<&str> = config
        .focus_areas
        .iter()
        .map(|area| match area {
            FocusArea::All => "all",
            FocusArea::Security => "security",
            FocusArea::Performance => "performance",
            FocusArea::Style => "style",
        })
        .collect();
    format!("Focus on {} issues.", areas.join(", "))
}

fn status_label(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Added => "added",
        FileStatus::Modified => "modified",
        FileStatus::Deleted => "deleted",
        FileStatus::Renamed => "renamed",
    }
}

/// Render the change set as annotated diffs, one section per file
///
/// Each line carries its new-side line number (old-side for removals) so the
/// model can anchor suggestions.
pub fn format_change_set(change_set: &ChangeSet) -> String {
    let mut output = String::new();
    if let Some(title) = change_set.title.as_deref().filter(|t| !t.trim().is_empty()) {
        output.push_str(&format!("# {}\n\n", title.trim()));
    }
    if let Some(description) = change_set
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
    {
        output.push_str(&format!("{}\n\n", description.trim()));
    }

    for file in &change_set.files {
        output.push_str(&format!("## {} ({})\n\n", file.path, status_label(file.status)));
        let mut body = String::new();
        for hunk in &file.hunks {
            if !hunk.header.is_empty() {
                body.push_str(&format!("{}\n", hunk.header));
            }
            for line in &hunk.lines {
                let (marker, number) = match line.kind {
                    LineKind::Added => ('+', line.new_line),
                    LineKind::Removed => ('-', line.old_line),
                    LineKind::Context => (' ', line.new_line.or(line.old_line)),
                };
                let number = number.map(|n| n.to_string()).unwrap_or_default();
                body.push_str(&format!("{:>5} {}{}\n", number, marker, line.content));
            }
        }
        let backticks = get_fence_backticks(&body);
        output.push_str(&format!("{}diff\n{}{}\n\n", backticks, body, backticks));
    }
    output.trim_end().to_string()
}

/// System and user messages for a streaming review
pub fn review_messages(
    change_set: &ChangeSet,
    config: &ReviewConfig,
    summary: Option<&Summary>,
) -> (String, String) {
    let mut user = String::new();
    user.push_str(&format!("{}\n", strictness_guidance(config.strictness)));
    user.push_str(&format!("{}\n\n", focus_guidance(config)));

    if let Some(summary) = summary {
        user.push_str(&format!("Summary of the change:\n{}\n\n", summary.text));
    }

    let format = RESPONSE_FORMAT.replace(
        "SUMMARY_FIELD",
        if summary.is_some() { "" } else { SUMMARY_FIELD },
    );
    user.push_str(&format!("Respond with exactly this JSON shape:\n{}\n\n", format));
    user.push_str(&format!("Changes to review:\n\n{}", format_change_set(change_set)));

    (REVIEW_SYSTEM_PROMPT.to_string(), user)
}

/// System and user messages for a one-shot change summary
pub fn summary_messages(change_set: &ChangeSet) -> (String, String) {
    let user = format!(
        "Summarize the following change.\nRespond with exactly this JSON shape:\n{}\n\n{}",
        SUMMARY_FORMAT,
        format_change_set(change_set)
    );
    (SUMMARY_SYSTEM_PROMPT.to_string(), user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangedFile, DiffLine, Hunk};

    fn change_set() -> ChangeSet {
        ChangeSet {
            title: Some("Add cache".into()),
            description: None,
            files: vec![ChangedFile {
                path: "src/cache.rs".into(),
                status: FileStatus::Modified,
                hunks: vec![Hunk {
                    header: "@@ -9,2 +9,2 @@".into(),
                    lines: vec![
                        DiffLine {
                            kind: LineKind::Context,
                            old_line: Some(9),
                            new_line: Some(9),
                            content: "fn get() {".into(),
                        },
                        DiffLine {
                            kind: LineKind::Removed,
                            old_line: Some(10),
                            new_line: None,
                            content: "    slow()".into(),
                        },
                        DiffLine {
                            kind: LineKind::Added,
                            old_line: None,
                            new_line: Some(10),
                            content: "    fast()".into(),
                        },
                    ],
                }],
            }],
        }
    }

    #[test]
    fn test_format_change_set_numbers_lines() {
        let text = format_change_set(&change_set());
        assert!(text.starts_with("# Add cache"));
        assert!(text.contains("## src/cache.rs (modified)"));
        assert!(text.contains("    9  fn get() {"));
        assert!(text.contains("   10 -    slow()"));
        assert!(text.contains("   10 +    fast()"));
    }

    #[test]
    fn test_review_messages_omit_summary_field_when_shared() {
        let config = ReviewConfig::default();
        let shared = Summary {
            text: "Swaps slow path for fast path".into(),
            ..Summary::default()
        };

        let (_, with_shared) = review_messages(&change_set(), &config, Some(&shared));
        assert!(with_shared.contains("Swaps slow path"));
        assert!(!with_shared.contains("\"summary\""));

        let (_, without) = review_messages(&change_set(), &config, None);
        assert!(without.contains("\"summary\""));
        assert!(without.find("\"suggestions\"") < without.find("\"verdict\""));
    }

    #[test]
    fn test_focus_guidance() {
        let mut config = ReviewConfig::default();
        assert_eq!(focus_guidance(&config), "Cover every category.");
        config.focus_areas = vec![FocusArea::Security, FocusArea::Performance];
        assert_eq!(focus_guidance(&config), "Focus on security, performance issues.");
        config.focus_areas.clear();
        assert_eq!(focus_guidance(&config), "Cover every category.");
    }
}
