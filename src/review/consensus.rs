use super::similarity::{SIMILARITY_THRESHOLD, group_by_similarity, similarity};
use crate::types::{
    ConfidenceLevel, ConsensusSuggestion, ExistingComment, LineRange, Priority, ProviderId,
    ReviewEvent, Suggestion, SuggestionKind, Summary, Verdict,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Quiet period before a batch of pending suggestions is clustered
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
/// Max line distance for a suggestion to duplicate an existing comment
pub const DEFAULT_DEDUP_LINE_DISTANCE: u32 = 5;
/// Aggregate summary used when no provider produced one
pub const FALLBACK_SUMMARY: &str = "No summary was produced for this change.";

// File comments: shared tokens longer than 3 characters
const FILE_COMMENT_TOKEN_LEN: usize = 4;
const FILE_COMMENT_SHARED_TOKENS: usize = 3;
// General discussion: shared tokens longer than 4 characters
const GENERAL_COMMENT_TOKEN_LEN: usize = 5;
const GENERAL_COMMENT_SHARED_TOKENS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub debounce: Duration,
    pub dedup_line_distance: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            dedup_line_distance: DEFAULT_DEDUP_LINE_DISTANCE,
        }
    }
}

/// `Collecting -> Finalizing -> Finalized`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Collecting,
    Finalizing,
    Finalized,
}

/// Confidence for `provider_count` agreeing providers out of `total_providers` active
pub fn confidence_for(provider_count: usize, total_providers: usize) -> (f64, ConfidenceLevel) {
    if total_providers <= 1 {
        return (0.6, ConfidenceLevel::Medium);
    }
    match provider_count {
        0 | 1 => (0.4, ConfidenceLevel::Low),
        2 => (0.75, ConfidenceLevel::Medium),
        _ => (0.9, ConfidenceLevel::High),
    }
}

/// Worst news wins: any `request_changes`, else any `approve`, else `comment`
pub fn aggregate_verdict(verdicts: &[Verdict]) -> Verdict {
    if verdicts.contains(&Verdict::RequestChanges) {
        Verdict::RequestChanges
    } else if verdicts.contains(&Verdict::Approve) {
        Verdict::Approve
    } else {
        Verdict::Comment
    }
}

fn is_visible(suggestion: &ConsensusSuggestion, total_providers: usize) -> bool {
    total_providers <= 1
        || suggestion.suggestion.priority == Priority::High
        || suggestion.provider_count > 1
}

fn significant_tokens(text: &str, min_len: usize) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= min_len)
        .map(String::from)
        .collect()
}

fn line_distance(suggestion: &Suggestion, line: u32) -> u32 {
    let (start, end) = suggestion.span();
    if line < start {
        start - line
    } else {
        line.saturating_sub(end)
    }
}

/// Whether `candidate` repeats something already raised in prior discussion
pub fn is_duplicate_of_existing(
    candidate: &Suggestion,
    comments: &[ExistingComment],
    max_line_distance: u32,
) -> bool {
    comments.iter().any(|comment| match comment.file_path.as_deref() {
        Some(path) if !path.is_empty() => {
            if path != candidate.file_path {
                return false;
            }
            let near = comment
                .line_number
                .is_none_or(|line| line_distance(candidate, line) <= max_line_distance);
            if !near {
                return false;
            }
            if comment.category == Some(candidate.category) {
                return true;
            }
            let ours = significant_tokens(&candidate.description, FILE_COMMENT_TOKEN_LEN);
            let theirs = significant_tokens(&comment.summary_text, FILE_COMMENT_TOKEN_LEN);
            ours.intersection(&theirs).count() >= FILE_COMMENT_SHARED_TOKENS
        }
        _ => {
            let ours = significant_tokens(&candidate.description, GENERAL_COMMENT_TOKEN_LEN);
            let theirs = significant_tokens(&comment.summary_text, GENERAL_COMMENT_TOKEN_LEN);
            ours.intersection(&theirs).count() >= GENERAL_COMMENT_SHARED_TOKENS
        }
    })
}

fn collapse_range(start: u32, end: u32) -> Option<LineRange> {
    (start != end).then_some(LineRange { start, end })
}

/// Fold `incoming` into an already registered suggestion
fn merge_into(existing: &mut ConsensusSuggestion, incoming: ConsensusSuggestion, total: usize) {
    let ConsensusSuggestion {
        suggestion: other,
        contributing_providers,
        provider_descriptions,
        ..
    } = incoming;

    existing.contributing_providers.extend(contributing_providers);
    existing.provider_count = existing.contributing_providers.len();
    let (confidence, level) = confidence_for(existing.provider_count, total);
    existing.confidence = confidence;
    existing.confidence_level = level;

    for (provider, description) in provider_descriptions {
        existing
            .provider_descriptions
            .entry(provider)
            .or_insert(description);
    }

    let target = &mut existing.suggestion;
    let (start, end) = target.span();
    let (other_start, other_end) = other.span();
    target.line_range = collapse_range(start.min(other_start), end.max(other_end));

    if other.description.chars().count() > target.description.chars().count() {
        target.description = other.description;
    }
    if target.suggested_code.is_none() && other.suggested_code.is_some() {
        target.suggested_code = other.suggested_code;
        target.kind = SuggestionKind::CodeChange;
    }
    target.priority = target.priority.max(other.priority);
}

/// Consensus state for one review session
///
/// All mutation goes through `&mut self`; [`spawn_engine`] wraps it in a
/// single-writer task that adds debouncing and cancellation.
#[derive(Debug)]
pub struct ConsensusEngine {
    total_providers: usize,
    settings: EngineSettings,
    existing_comments: Vec<ExistingComment>,
    state: SessionState,
    pending: Vec<Suggestion>,
    emitted: HashMap<String, ConsensusSuggestion>,
    emission_order: Vec<String>,
    visible: HashSet<String>,
    completed: HashSet<ProviderId>,
    received: HashMap<ProviderId, usize>,
    verdicts: Vec<Verdict>,
    summaries: Vec<String>,
    summary_broadcast: bool,
}

impl ConsensusEngine {
    pub fn new(
        total_providers: usize,
        settings: EngineSettings,
        existing_comments: Vec<ExistingComment>,
    ) -> Self {
        Self {
            total_providers,
            settings,
            existing_comments,
            state: SessionState::Collecting,
            pending: Vec::new(),
            emitted: HashMap::new(),
            emission_order: Vec::new(),
            visible: HashSet::new(),
            completed: HashSet::new(),
            received: HashMap::new(),
            verdicts: Vec::new(),
            summaries: Vec::new(),
            summary_broadcast: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finalized(&self) -> bool {
        self.state == SessionState::Finalized
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn debounce(&self) -> Duration {
        self.settings.debounce
    }

    /// Suggestions released to the consumer, in first-emission order
    pub fn visible_suggestions(&self) -> Vec<&ConsensusSuggestion> {
        self.emission_order
            .iter()
            .filter(|id| self.visible.contains(*id))
            .filter_map(|id| self.emitted.get(id))
            .collect()
    }

    /// Queue a suggestion for the next clustering pass. Returns `false` once finalized.
    pub fn add_suggestion(&mut self, suggestion: Suggestion) -> bool {
        if self.state != SessionState::Collecting {
            warn!(
                "Ignoring suggestion {} from '{}' after finalization",
                suggestion.id, suggestion.provider_id
            );
            return false;
        }
        trace!("Queued suggestion {}", suggestion.id);
        *self
            .received
            .entry(suggestion.provider_id.clone())
            .or_default() += 1;
        self.pending.push(suggestion);
        true
    }

    /// Drain the pending queue through one clustering pass
    pub fn process_pending(&mut self) -> Vec<ReviewEvent> {
        if self.pending.is_empty() {
            return Vec::new();
        }

        let batch = std::mem::take(&mut self.pending);
        let batch_len = batch.len();
        let clusters = group_by_similarity(batch);
        debug!(
            "Clustered {} pending suggestions into {} groups",
            batch_len,
            clusters.len()
        );

        clusters
            .into_iter()
            .filter_map(|cluster| self.process_group(cluster))
            .collect()
    }

    /// Merge a cluster into the emitted set, returning the event the consumer should see
    pub fn process_group(&mut self, cluster: Vec<Suggestion>) -> Option<ReviewEvent> {
        let candidate = self.build_candidate(cluster)?;

        if is_duplicate_of_existing(
            &candidate.suggestion,
            &self.existing_comments,
            self.settings.dedup_line_distance,
        ) {
            debug!(
                "Suppressing {} at {}:{}, already raised in existing discussion",
                candidate.id(),
                candidate.suggestion.file_path,
                candidate.suggestion.line_number
            );
            return None;
        }

        let matched = self
            .emission_order
            .iter()
            .find(|id| {
                self.emitted.get(*id).is_some_and(|existing| {
                    similarity(&existing.suggestion, &candidate.suggestion) >= SIMILARITY_THRESHOLD
                })
            })
            .cloned();

        let total = self.total_providers;
        match matched {
            Some(id) => {
                let existing = self.emitted.get_mut(&id)?;
                merge_into(existing, candidate, total);
                let was_visible = self.visible.contains(&id);
                let now_visible = is_visible(existing, total);
                debug!(
                    "Merged into {} ({} providers, confidence {:.2})",
                    id, existing.provider_count, existing.confidence
                );

                if was_visible {
                    Some(ReviewEvent::SuggestionUpdated {
                        id,
                        suggestion: existing.clone(),
                    })
                } else if now_visible {
                    info!("Suggestion {} is now corroborated, revealing", id);
                    let revealed = existing.clone();
                    self.visible.insert(id);
                    Some(ReviewEvent::SuggestionAdded(revealed))
                } else {
                    None
                }
            }
            None => {
                let id = candidate.id().to_string();
                let visible = is_visible(&candidate, total);
                self.emission_order.push(id.clone());
                self.emitted.insert(id.clone(), candidate.clone());
                if visible {
                    self.visible.insert(id);
                    Some(ReviewEvent::SuggestionAdded(candidate))
                } else {
                    trace!("Holding back uncorroborated suggestion {}", id);
                    None
                }
            }
        }
    }

    fn build_candidate(&self, mut cluster: Vec<Suggestion>) -> Option<ConsensusSuggestion> {
        let contributing_providers: BTreeSet<ProviderId> =
            cluster.iter().map(|s| s.provider_id.clone()).collect();
        // A provider's first suggestion in arrival order speaks for it
        let mut provider_descriptions = BTreeMap::new();
        for s in &cluster {
            provider_descriptions
                .entry(s.provider_id.clone())
                .or_insert_with(|| s.description.clone());
        }

        // Stable: ties keep arrival order
        cluster.sort_by(|a, b| b.priority.cmp(&a.priority));

        let start = cluster.iter().map(|s| s.span().0).min()?;
        let end = cluster.iter().map(|s| s.span().1).max()?;
        let description = cluster
            .iter()
            .map(|s| &s.description)
            .fold(None::<&String>, |longest, d| match longest {
                Some(l) if l.chars().count() >= d.chars().count() => Some(l),
                _ => Some(d),
            })
            .cloned()
            .unwrap_or_default();
        let suggested_code = cluster.iter().find_map(|s| s.suggested_code.clone());

        let mut base = cluster.into_iter().next()?;
        base.line_range = collapse_range(start, end);
        base.description = description;
        if suggested_code.is_some() && base.suggested_code.is_none() {
            base.kind = SuggestionKind::CodeChange;
        }
        base.suggested_code = suggested_code;

        let provider_count = contributing_providers.len();
        let (confidence, confidence_level) = confidence_for(provider_count, self.total_providers);
        Some(ConsensusSuggestion {
            suggestion: base,
            confidence,
            confidence_level,
            contributing_providers,
            provider_count,
            provider_descriptions,
        })
    }

    pub fn provider_started(&mut self, id: &str) -> Vec<ReviewEvent> {
        if self.is_finalized() {
            return Vec::new();
        }
        info!("[Provider {}] Started", id);
        vec![ReviewEvent::ProviderStarted { id: id.to_string() }]
    }

    pub fn provider_completed(&mut self, id: &str, verdict: Option<Verdict>) -> Vec<ReviewEvent> {
        if self.is_finalized() || !self.completed.insert(id.to_string()) {
            debug!("[Provider {}] Ignoring repeated completion", id);
            return Vec::new();
        }
        if let Some(verdict) = verdict {
            self.verdicts.push(verdict);
        }
        let count = self.received.get(id).copied().unwrap_or_default();
        info!(
            "[Provider {}] Completed with {} suggestions, verdict {:?}",
            id, count, verdict
        );

        let mut events = vec![ReviewEvent::ProviderCompleted {
            id: id.to_string(),
            count,
        }];
        events.extend(self.finalize_if_done());
        events
    }

    pub fn provider_error(&mut self, id: &str, message: &str) -> Vec<ReviewEvent> {
        if self.is_finalized() || !self.completed.insert(id.to_string()) {
            debug!("[Provider {}] Ignoring error after completion: {}", id, message);
            return Vec::new();
        }
        warn!("[Provider {}] Failed: {}", id, message);

        let mut events = vec![ReviewEvent::ProviderError {
            id: id.to_string(),
            message: message.to_string(),
        }];
        events.extend(self.finalize_if_done());
        events
    }

    /// Record a summary for the aggregate; only the first one is broadcast
    pub fn record_summary(&mut self, provider: Option<&str>, summary: Summary) -> Vec<ReviewEvent> {
        if self.is_finalized() {
            return Vec::new();
        }
        if !summary.text.trim().is_empty() {
            self.summaries.push(summary.text.clone());
        }
        if self.summary_broadcast {
            trace!(
                "Recorded summary from {}, not re-broadcast",
                provider.unwrap_or("shared")
            );
            return Vec::new();
        }
        self.summary_broadcast = true;
        debug!("Broadcasting summary from {}", provider.unwrap_or("shared"));
        vec![ReviewEvent::Summary(summary)]
    }

    /// Drain pending suggestions and finalize now, ignoring outstanding providers
    pub fn flush(&mut self) -> Vec<ReviewEvent> {
        if self.is_finalized() {
            return Vec::new();
        }
        info!(
            "Flushing review session with {}/{} providers settled",
            self.completed.len(),
            self.total_providers
        );
        self.finalize()
    }

    pub fn apply(&mut self, command: EngineCommand) -> Vec<ReviewEvent> {
        match command {
            EngineCommand::AddSuggestion(suggestion) => {
                self.add_suggestion(suggestion);
                Vec::new()
            }
            EngineCommand::ProviderStarted(id) => self.provider_started(&id),
            EngineCommand::ProviderCompleted { id, verdict } => {
                self.provider_completed(&id, verdict)
            }
            EngineCommand::ProviderError { id, message } => self.provider_error(&id, &message),
            EngineCommand::Summary { provider, summary } => {
                self.record_summary(provider.as_deref(), summary)
            }
            EngineCommand::Flush => self.flush(),
        }
    }

    fn finalize_if_done(&mut self) -> Vec<ReviewEvent> {
        if self.completed.len() >= self.total_providers {
            self.finalize()
        } else {
            Vec::new()
        }
    }

    fn finalize(&mut self) -> Vec<ReviewEvent> {
        self.state = SessionState::Finalizing;
        let mut events = self.process_pending();

        let verdict = aggregate_verdict(&self.verdicts);
        let summary_text = self
            .summaries
            .iter()
            .fold(None::<&String>, |longest, s| match longest {
                Some(l) if l.chars().count() >= s.chars().count() => Some(l),
                _ => Some(s),
            })
            .cloned()
            .unwrap_or_else(|| FALLBACK_SUMMARY.to_string());

        self.state = SessionState::Finalized;
        info!(
            "Review finalized: verdict {}, {} visible suggestions",
            verdict,
            self.visible.len()
        );
        events.push(ReviewEvent::Complete {
            summary_text,
            verdict,
        });
        events
    }
}

/// Messages accepted by the engine task
#[derive(Debug, Clone)]
pub enum EngineCommand {
    AddSuggestion(Suggestion),
    ProviderStarted(ProviderId),
    ProviderCompleted {
        id: ProviderId,
        verdict: Option<Verdict>,
    },
    ProviderError {
        id: ProviderId,
        message: String,
    },
    Summary {
        provider: Option<ProviderId>,
        summary: Summary,
    },
    Flush,
}

/// Cloneable sender side of a running engine task
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    fn send(&self, command: EngineCommand) {
        if self.commands.send(command).is_err() {
            trace!("Consensus engine stopped, dropping command");
        }
    }

    pub fn add_suggestion(&self, suggestion: Suggestion) {
        self.send(EngineCommand::AddSuggestion(suggestion));
    }

    pub fn provider_started(&self, id: &str) {
        self.send(EngineCommand::ProviderStarted(id.to_string()));
    }

    pub fn provider_completed(&self, id: &str, verdict: Option<Verdict>) {
        self.send(EngineCommand::ProviderCompleted {
            id: id.to_string(),
            verdict,
        });
    }

    pub fn provider_error(&self, id: &str, message: &str) {
        self.send(EngineCommand::ProviderError {
            id: id.to_string(),
            message: message.to_string(),
        });
    }

    pub fn summary(&self, provider: Option<&str>, summary: Summary) {
        self.send(EngineCommand::Summary {
            provider: provider.map(String::from),
            summary,
        });
    }

    pub fn flush(&self) {
        self.send(EngineCommand::Flush);
    }
}

/// Run `engine` on its own task, delivering events to `events` until it
/// finalizes or `cancel` fires.
pub fn spawn_engine(
    engine: ConsensusEngine,
    events: mpsc::Sender<ReviewEvent>,
    cancel: CancellationToken,
) -> (EngineHandle, JoinHandle<ConsensusEngine>) {
    let (commands, receiver) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_engine(engine, receiver, events, cancel));
    (EngineHandle { commands }, task)
}

async fn run_engine(
    mut engine: ConsensusEngine,
    mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    events: mpsc::Sender<ReviewEvent>,
    cancel: CancellationToken,
) -> ConsensusEngine {
    // Pending debounce deadline; cleared when the batch is processed
    let mut deadline: Option<Instant> = None;

    loop {
        let outgoing = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Review session cancelled, stopping consensus engine");
                return engine;
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                engine.process_pending()
            }
            command = commands.recv() => match command {
                Some(EngineCommand::AddSuggestion(suggestion)) => {
                    if engine.add_suggestion(suggestion) {
                        deadline = Some(Instant::now() + engine.debounce());
                    }
                    Vec::new()
                }
                Some(command) => engine.apply(command),
                None => {
                    debug!("All engine handles dropped, flushing");
                    engine.flush()
                }
            },
        };

        for event in outgoing {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return engine,
                sent = events.send(event) => {
                    if sent.is_err() {
                        debug!("Event receiver dropped, stopping consensus engine");
                        return engine;
                    }
                }
            }
        }

        if engine.is_finalized() {
            return engine;
        }
    }
}
