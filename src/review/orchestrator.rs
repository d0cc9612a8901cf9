use super::consensus::{ConsensusEngine, EngineHandle, EngineSettings, spawn_engine};
use super::extractor::{IdSequence, ProviderOutput, StreamExtractor, parse_final_output};
use crate::error::ReviewError;
use crate::provider::Provider;
use crate::types::{ChangeSet, ExistingComment, ProviderId, ReviewConfig, ReviewEvent, Summary};
use futures::StreamExt;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const ELAPSED_TIME_PRECISION: usize = 2;

/// Settlement counts of one session's provider tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Runs every active provider against one change set, feeding a shared consensus engine
pub struct Orchestrator {
    providers: Vec<Arc<dyn Provider>>,
    config: ReviewConfig,
    settings: EngineSettings,
    summary_provider: Option<ProviderId>,
    existing_comments: Vec<ExistingComment>,
}

impl Orchestrator {
    pub fn new(providers: Vec<Arc<dyn Provider>>, config: ReviewConfig) -> Self {
        Self {
            providers,
            config,
            settings: EngineSettings::default(),
            summary_provider: None,
            existing_comments: Vec::new(),
        }
    }

    pub fn engine_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Provider asked for the shared summary; the first active provider otherwise
    pub fn summary_provider(mut self, id: Option<ProviderId>) -> Self {
        self.summary_provider = id;
        self
    }

    pub fn existing_comments(mut self, comments: Vec<ExistingComment>) -> Self {
        self.existing_comments = comments;
        self
    }

    /// Providers that are both enabled and ready, first one wins per id
    pub fn active_providers(&self) -> Vec<Arc<dyn Provider>> {
        let mut seen = HashSet::new();
        self.providers
            .iter()
            .filter(|p| {
                let enabled = self.config.is_enabled(p.id());
                let ready = enabled && p.is_ready(&self.config);
                if !enabled {
                    debug!("[Provider {}] Not enabled, skipping", p.id());
                    return false;
                }
                if !ready {
                    warn!("[Provider {}] Enabled but not ready, skipping", p.id());
                    return false;
                }
                if !seen.insert(p.id().to_string()) {
                    warn!("[Provider {}] Duplicate provider id, skipping", p.id());
                    return false;
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Start a review session. Must be called from within a Tokio runtime.
    pub fn run(&self, change_set: ChangeSet) -> ReviewSession {
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let providers = self.active_providers();
        if providers.is_empty() {
            let message = ReviewError::NoActiveProviders.to_string();
            error!("{}", message);
            if events_tx
                .try_send(ReviewEvent::FatalError { message })
                .is_err()
            {
                warn!("Failed to deliver fatal error event");
            }
            return ReviewSession {
                events,
                engine: None,
                cancel,
                task: None,
            };
        }

        info!(
            "Starting review of {} files with {} providers",
            change_set.files.len(),
            providers.len()
        );
        let engine = ConsensusEngine::new(
            providers.len(),
            self.settings.clone(),
            self.existing_comments.clone(),
        );
        // The engine task is detached; it stops once finalized or cancelled
        let (handle, _engine_task) = spawn_engine(engine, events_tx, cancel.clone());

        let task = tokio::spawn(run_providers(
            providers,
            Arc::new(change_set),
            Arc::new(self.config.clone()),
            self.summary_provider.clone(),
            handle.clone(),
            cancel.clone(),
        ));

        ReviewSession {
            events,
            engine: Some(handle),
            cancel,
            task: Some(task),
        }
    }
}

/// Handle to an in-flight review
pub struct ReviewSession {
    events: mpsc::Receiver<ReviewEvent>,
    engine: Option<EngineHandle>,
    cancel: CancellationToken,
    task: Option<JoinHandle<SessionReport>>,
}

impl ReviewSession {
    /// Next consumer event; `None` once the session has ended or been cancelled
    pub async fn next_event(&mut self) -> Option<ReviewEvent> {
        self.events.recv().await
    }

    /// Finish early: cluster whatever is pending and emit `complete`
    pub fn flush(&self) {
        if let Some(engine) = &self.engine {
            engine.flush();
        }
    }

    /// Stop event delivery and abandon running provider streams
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for every provider task to settle
    pub async fn wait(self) -> SessionReport {
        let Some(task) = self.task else {
            return SessionReport::default();
        };
        match task.await {
            Ok(report) => report,
            Err(e) => {
                error!("Review task failed: {}", e);
                SessionReport::default()
            }
        }
    }
}

async fn run_providers(
    providers: Vec<Arc<dyn Provider>>,
    change_set: Arc<ChangeSet>,
    config: Arc<ReviewConfig>,
    summary_provider: Option<ProviderId>,
    handle: EngineHandle,
    cancel: CancellationToken,
) -> SessionReport {
    let shared_summary = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        summary = generate_shared_summary(&providers, summary_provider.as_deref(), &change_set, &config) => summary,
    };
    if let Some(summary) = &shared_summary {
        handle.summary(None, summary.clone());
    }

    let ids = IdSequence::new();
    debug!("Creating review futures for {} providers", providers.len());
    let futures: Vec<_> = providers
        .into_iter()
        .map(|provider| {
            review_with_provider(
                provider,
                change_set.clone(),
                config.clone(),
                shared_summary.clone(),
                handle.clone(),
                ids.clone(),
                cancel.clone(),
            )
        })
        .collect();
    drop(handle);

    let results = join_all(futures).await;
    let failed = results.iter().filter(|r| r.is_err()).count();
    let succeeded = results.len() - failed;
    if cancel.is_cancelled() {
        warn!(
            "Review cancelled: {} succeeded, {} failed or abandoned",
            succeeded, failed
        );
    } else {
        info!(
            "Providers settled: {} succeeded, {} failed",
            succeeded, failed
        );
    }
    SessionReport { succeeded, failed }
}

async fn generate_shared_summary(
    providers: &[Arc<dyn Provider>],
    preferred: Option<&str>,
    change_set: &ChangeSet,
    config: &ReviewConfig,
) -> Option<Summary> {
    let provider = preferred
        .and_then(|id| providers.iter().find(|p| p.id() == id))
        .or_else(|| providers.first())?;

    match provider.generate_summary(change_set, config).await {
        Ok(Some(summary)) => {
            info!("[Provider {}] Generated shared summary", provider.id());
            Some(summary)
        }
        Ok(None) => {
            debug!("[Provider {}] No shared summary available", provider.id());
            None
        }
        Err(e) => {
            warn!(
                "[Provider {}] Shared summary failed, providers will summarize individually: {:#}",
                provider.id(),
                e
            );
            None
        }
    }
}

/// Drive one provider to settlement, reporting the outcome to the engine
async fn review_with_provider(
    provider: Arc<dyn Provider>,
    change_set: Arc<ChangeSet>,
    config: Arc<ReviewConfig>,
    shared_summary: Option<Summary>,
    handle: EngineHandle,
    ids: IdSequence,
    cancel: CancellationToken,
) -> Result<usize, ReviewError> {
    let id = provider.id().to_string();
    let start = Instant::now();
    handle.provider_started(&id);

    let result = stream_provider(
        provider.as_ref(),
        &change_set,
        &config,
        shared_summary.as_ref(),
        &handle,
        ids,
        &cancel,
    )
    .await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok((output, count)) => {
            if shared_summary.is_none() {
                if let Some(summary) = output.summary {
                    handle.summary(Some(&id), summary);
                }
            }
            info!(
                "[Provider {}] Finished in {:.prec$}s: {} suggestions, verdict {}",
                id,
                elapsed,
                count,
                output.verdict,
                prec = ELAPSED_TIME_PRECISION
            );
            handle.provider_completed(&id, Some(output.verdict));
            Ok(count)
        }
        Err(e) => {
            error!(
                "[Provider {}] Failed after {:.prec$}s: {}",
                id,
                elapsed,
                e,
                prec = ELAPSED_TIME_PRECISION
            );
            handle.provider_error(&id, &e.to_string());
            Err(e)
        }
    }
}

async fn stream_provider(
    provider: &dyn Provider,
    change_set: &ChangeSet,
    config: &ReviewConfig,
    shared_summary: Option<&Summary>,
    handle: &EngineHandle,
    ids: IdSequence,
    cancel: &CancellationToken,
) -> Result<(ProviderOutput, usize), ReviewError> {
    let id = provider.id();
    let provider_error = |message: String| ReviewError::Provider {
        provider: id.to_string(),
        message,
    };

    let mut stream = provider
        .stream_review(change_set, config, shared_summary)
        .await
        .map_err(|e| provider_error(format!("{:#}", e)))?;

    let forward = handle.clone();
    let mut abort_reason = None;
    let mut extractor = StreamExtractor::new(
        id,
        ids,
        move |suggestion| forward.add_suggestion(suggestion),
        |reason: &str| abort_reason = Some(reason.to_string()),
    );

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("[Provider {}] Cancelled, abandoning stream", id);
                return Err(provider_error("review cancelled".to_string()));
            }
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(text)) => {
                if !extractor.process(&text) {
                    drop(extractor);
                    return Err(ReviewError::Hallucination {
                        provider: id.to_string(),
                        reason: abort_reason.unwrap_or_default(),
                    });
                }
            }
            Some(Err(e)) => return Err(provider_error(format!("{:#}", e))),
            None => break,
        }
    }

    debug!(
        "[Provider {}] Stream ended after {} characters",
        id,
        extractor.final_text().len()
    );
    Ok((parse_final_output(extractor.final_text()), extractor.emitted()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TokenStream;
    use crate::types::{ConfidenceLevel, LineRange, Priority, Verdict};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed chunk script
    struct ScriptedProvider {
        id: String,
        ready: bool,
        open_error: Option<String>,
        chunks: Vec<Result<String, String>>,
        hang: bool,
        summary: Option<Summary>,
        summary_calls: AtomicUsize,
        received_summaries: Mutex<Vec<Option<Summary>>>,
    }

    impl ScriptedProvider {
        fn new(id: &str, chunks: &[&str]) -> Self {
            Self {
                id: id.into(),
                ready: true,
                open_error: None,
                chunks: chunks.iter().map(|c| Ok(c.to_string())).collect(),
                hang: false,
                summary: None,
                summary_calls: AtomicUsize::new(0),
                received_summaries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_ready(&self, _config: &ReviewConfig) -> bool {
            self.ready
        }

        async fn stream_review(
            &self,
            _change_set: &ChangeSet,
            _config: &ReviewConfig,
            summary: Option<&Summary>,
        ) -> anyhow::Result<TokenStream> {
            self.received_summaries
                .lock()
                .unwrap()
                .push(summary.cloned());
            if let Some(message) = &self.open_error {
                anyhow::bail!("{}", message);
            }
            let items: Vec<anyhow::Result<String>> = self
                .chunks
                .iter()
                .map(|c| c.clone().map_err(|e| anyhow::anyhow!(e)))
                .collect();
            let stream = futures::stream::iter(items);
            if self.hang {
                Ok(stream.chain(futures::stream::pending()).boxed())
            } else {
                Ok(stream.boxed())
            }
        }

        async fn generate_summary(
            &self,
            _change_set: &ChangeSet,
            _config: &ReviewConfig,
        ) -> anyhow::Result<Option<Summary>> {
            self.summary_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.summary.clone())
        }
    }

    fn config(enabled: &[&str]) -> ReviewConfig {
        ReviewConfig {
            enabled_providers: enabled.iter().map(|s| s.to_string()).collect(),
            ..ReviewConfig::default()
        }
    }

    fn summary(text: &str) -> Summary {
        Summary {
            text: text.into(),
            ..Summary::default()
        }
    }

    async fn collect(session: &mut ReviewSession) -> Vec<ReviewEvent> {
        let mut events = Vec::new();
        while let Some(event) = session.next_event().await {
            events.push(event);
        }
        events
    }

    fn added(events: &[ReviewEvent]) -> Vec<&crate::types::ConsensusSuggestion> {
        events
            .iter()
            .filter_map(|e| match e {
                ReviewEvent::SuggestionAdded(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    const PROVIDER_A: &str = r#"{"suggestions": [{"filePath": "file.ts", "lineNumber": 10,
        "priority": "medium", "category": "style",
        "description": "Rename the counter variable to describe its purpose clearly"}],
        "verdict": "comment"}"#;

    const PROVIDER_B: &str = r#"{"suggestions": [{"filePath": "file.ts", "lineNumber": 12,
        "priority": "medium", "category": "style",
        "description": "Rename the counter variable to describe its purpose"}],
        "verdict": "approve"}"#;

    fn chunked(text: &str, size: usize) -> Vec<String> {
        text.chars()
            .collect::<Vec<_>>()
            .chunks(size)
            .map(|c| c.iter().collect())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_providers_reach_consensus() {
        let a_chunks = chunked(PROVIDER_A, 7);
        let b_chunks = chunked(PROVIDER_B, 3);
        let a = ScriptedProvider::new(
            "a",
            &a_chunks.iter().map(String::as_str).collect::<Vec<_>>(),
        );
        let b = ScriptedProvider::new(
            "b",
            &b_chunks.iter().map(String::as_str).collect::<Vec<_>>(),
        );
        let orchestrator = Orchestrator::new(vec![Arc::new(a), Arc::new(b)], config(&["a", "b"]));

        let mut session = orchestrator.run(ChangeSet::default());
        let events = collect(&mut session).await;
        let report = session.wait().await;
        assert_eq!(report, SessionReport { succeeded: 2, failed: 0 });

        let added = added(&events);
        assert_eq!(added.len(), 1);
        let merged = added[0];
        assert_eq!(merged.provider_count, 2);
        assert_eq!(merged.confidence, 0.75);
        assert_eq!(merged.confidence_level, ConfidenceLevel::Medium);
        assert_eq!(
            merged.suggestion.line_range,
            Some(LineRange { start: 10, end: 12 })
        );
        assert_eq!(merged.provider_descriptions.len(), 2);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, ReviewEvent::SuggestionUpdated { .. }))
        );

        let started = events
            .iter()
            .filter(|e| matches!(e, ReviewEvent::ProviderStarted { .. }))
            .count();
        assert_eq!(started, 2);
        assert!(events.contains(&ReviewEvent::ProviderCompleted {
            id: "a".into(),
            count: 1
        }));
        assert_eq!(
            events.last(),
            Some(&ReviewEvent::Complete {
                summary_text: crate::review::consensus::FALLBACK_SUMMARY.into(),
                verdict: Verdict::Approve,
            })
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_no_active_providers_is_fatal() {
        let mut not_ready = ScriptedProvider::new("a", &[PROVIDER_A]);
        not_ready.ready = false;
        let not_enabled = ScriptedProvider::new("b", &[PROVIDER_B]);
        let orchestrator = Orchestrator::new(
            vec![Arc::new(not_ready), Arc::new(not_enabled)],
            config(&["a"]),
        );
        assert!(orchestrator.active_providers().is_empty());

        let mut session = orchestrator.run(ChangeSet::default());
        let events = collect(&mut session).await;
        assert_eq!(
            events,
            vec![ReviewEvent::FatalError {
                message: ReviewError::NoActiveProviders.to_string()
            }]
        );
        assert_eq!(session.wait().await, SessionReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_provider_ids_run_once() {
        let first = Arc::new(ScriptedProvider::new("a", &[PROVIDER_A]));
        let second = Arc::new(ScriptedProvider::new("a", &[PROVIDER_B]));
        let orchestrator =
            Orchestrator::new(vec![first.clone(), second.clone()], config(&["a"]));
        assert_eq!(orchestrator.active_providers().len(), 1);

        let mut session = orchestrator.run(ChangeSet::default());
        let events = collect(&mut session).await;
        assert_eq!(
            session.wait().await,
            SessionReport {
                succeeded: 1,
                failed: 0
            }
        );

        assert_eq!(first.received_summaries.lock().unwrap().len(), 1);
        assert!(second.received_summaries.lock().unwrap().is_empty());
        let started = events
            .iter()
            .filter(|e| matches!(e, ReviewEvent::ProviderStarted { .. }))
            .count();
        assert_eq!(started, 1);
        assert!(matches!(
            events.last(),
            Some(ReviewEvent::Complete {
                verdict: Verdict::Comment,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_provider_does_not_stop_others() {
        let mut failing = ScriptedProvider::new("a", &[]);
        failing.open_error = Some("rate limited".into());
        let mut broken_mid_stream = ScriptedProvider::new("c", &["{\"suggestions\": ["]);
        broken_mid_stream.chunks.push(Err("connection reset".into()));
        let healthy = ScriptedProvider::new(
            "b",
            &[r#"{"suggestions": [{"filePath": "src/db.rs", "lineNumber": 4,
                "priority": "high", "category": "security",
                "description": "Query is built by string concatenation"}],
                "verdict": "request_changes"}"#],
        );
        let orchestrator = Orchestrator::new(
            vec![Arc::new(failing), Arc::new(healthy), Arc::new(broken_mid_stream)],
            config(&["a", "b", "c"]),
        );

        let mut session = orchestrator.run(ChangeSet::default());
        let events = collect(&mut session).await;
        assert_eq!(
            session.wait().await,
            SessionReport {
                succeeded: 1,
                failed: 2
            }
        );

        let errors: Vec<(&str, &str)> = events
            .iter()
            .filter_map(|e| match e {
                ReviewEvent::ProviderError { id, message } => Some((id.as_str(), message.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|(id, m)| *id == "a" && m.contains("rate limited")));
        assert!(errors.iter().any(|(id, m)| *id == "c" && m.contains("connection reset")));

        // High priority is visible without corroboration
        let added = added(&events);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].suggestion.priority, Priority::High);
        assert!(matches!(
            events.last(),
            Some(ReviewEvent::Complete {
                verdict: Verdict::RequestChanges,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hallucination_surfaces_as_provider_error() {
        let provider = ScriptedProvider::new(
            "a",
            &["{\"suggestions\": [{\"filePath\": \"a.rs\", \"lineNumber\": ", "123456789012345678"],
        );
        let orchestrator = Orchestrator::new(vec![Arc::new(provider)], config(&["a"]));

        let mut session = orchestrator.run(ChangeSet::default());
        let events = collect(&mut session).await;

        let message = events
            .iter()
            .find_map(|e| match e {
                ReviewEvent::ProviderError { message, .. } => Some(message.clone()),
                _ => None,
            })
            .unwrap();
        assert!(message.contains("runaway numeric output"));
        assert!(matches!(
            events.last(),
            Some(ReviewEvent::Complete {
                verdict: Verdict::Comment,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_summary_from_preferred_provider() {
        let mut a = ScriptedProvider::new(
            "a",
            &[r#"{"suggestions": [], "verdict": "approve", "summary": "From a's stream"}"#],
        );
        a.summary = Some(summary("Summary from a"));
        let mut b = ScriptedProvider::new("b", &[r#"{"suggestions": [], "verdict": "approve"}"#]);
        b.summary = Some(summary("Shared summary from b"));
        let a = Arc::new(a);
        let b = Arc::new(b);

        let orchestrator = Orchestrator::new(vec![a.clone(), b.clone()], config(&["a", "b"]))
            .summary_provider(Some("b".into()));
        let mut session = orchestrator.run(ChangeSet::default());
        let events = collect(&mut session).await;
        session.wait().await;

        assert_eq!(a.summary_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.summary_calls.load(Ordering::SeqCst), 1);
        let broadcast: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ReviewEvent::Summary(_)))
            .collect();
        assert_eq!(
            broadcast,
            vec![&ReviewEvent::Summary(summary("Shared summary from b"))]
        );
        assert_eq!(
            *a.received_summaries.lock().unwrap(),
            vec![Some(summary("Shared summary from b"))]
        );
        assert!(matches!(
            events.last(),
            Some(ReviewEvent::Complete { summary_text, .. }) if summary_text == "Shared summary from b"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_summaries_without_shared_summary() {
        let a = ScriptedProvider::new(
            "a",
            &[r#"{"suggestions": [], "verdict": "comment", "summary": "Short"}"#],
        );
        let b = ScriptedProvider::new(
            "b",
            &[r#"{"suggestions": [], "verdict": "comment", "summary": {"text": "A much longer summary"}}"#],
        );
        let orchestrator = Orchestrator::new(vec![Arc::new(a), Arc::new(b)], config(&["a", "b"]));
        let mut session = orchestrator.run(ChangeSet::default());
        let events = collect(&mut session).await;

        let broadcasts = events
            .iter()
            .filter(|e| matches!(e, ReviewEvent::Summary(_)))
            .count();
        assert_eq!(broadcasts, 1);
        assert!(matches!(
            events.last(),
            Some(ReviewEvent::Complete { summary_text, .. }) if summary_text == "A much longer summary"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_then_cancel_abandons_hanging_provider() {
        let mut hanging = ScriptedProvider::new(
            "a",
            &[r#"{"suggestions": [{"filePath": "a.rs", "lineNumber": 1, "description": "First"},"#],
        );
        hanging.hang = true;
        let orchestrator = Orchestrator::new(vec![Arc::new(hanging)], config(&["a"]));
        let mut session = orchestrator.run(ChangeSet::default());

        // The debounce releases the suggestion while the stream is still open
        loop {
            match session.next_event().await {
                Some(ReviewEvent::SuggestionAdded(s)) => {
                    assert_eq!(s.suggestion.description, "First");
                    break;
                }
                Some(event) => assert!(!event.is_terminal()),
                None => panic!("session ended early"),
            }
        }

        session.flush();
        let rest = collect(&mut session).await;
        assert!(matches!(rest.last(), Some(ReviewEvent::Complete { .. })));

        session.cancel();
        assert_eq!(
            session.wait().await,
            SessionReport {
                succeeded: 0,
                failed: 1
            }
        );
    }
}
