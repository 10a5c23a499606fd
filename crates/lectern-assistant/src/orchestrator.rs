use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use lectern_core::errors::ProviderError;
use lectern_core::ids::SessionId;
use lectern_core::provider::{AssistantProvider, CreateAssistantRequest};
use lectern_provider::{PollError, PollingClient};
use lectern_store::sessions::{LockedResources, SessionRecord, SessionRepo, SessionStatus};
use lectern_store::StoreError;

use crate::error::AssistantError;

pub const DEFAULT_RUN_RETRIES: u32 = 2;

/// Remote handles a task works against: resolved once per task, either by
/// materializing an active session or resuming a locked one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionResources {
    pub document_ids: Vec<String>,
    pub assistant_id: String,
    pub thread_id: String,
}

/// Creates, resumes, queries, and destroys the remote assistant resources
/// tied to a session.
///
/// The session status is an explicit two-state machine: `active` sessions
/// get materialized (the single point where remote resources are created),
/// `locked` sessions get resumed from the persisted ids. The conditional
/// lock update in the store makes the transition atomic, so a retried task
/// re-entering here can never create a second set of resources.
pub struct ResourceOrchestrator {
    provider: Arc<dyn AssistantProvider>,
    sessions: SessionRepo,
    poller: PollingClient,
    run_retries: u32,
}

impl ResourceOrchestrator {
    pub fn new(
        provider: Arc<dyn AssistantProvider>,
        sessions: SessionRepo,
        poller: PollingClient,
        run_retries: u32,
    ) -> Self {
        Self {
            provider,
            sessions,
            poller,
            run_retries,
        }
    }

    /// Resolve the remote resources for a session, locking it on first use.
    #[instrument(skip(self, instructions), fields(session_id = %session_id))]
    pub async fn prepare(
        &self,
        session_id: &SessionId,
        instructions: Option<&str>,
    ) -> Result<SessionResources, AssistantError> {
        let session = self.get_session(session_id)?;

        match session.status {
            SessionStatus::Locked => self.resume(&session).await,
            SessionStatus::Active => self.materialize(session, instructions).await,
        }
    }

    /// Resume a locked session from its persisted ids, verifying each still
    /// exists upstream. Performs no creation calls; repeated resumes observe
    /// identical ids.
    async fn resume(&self, session: &SessionRecord) -> Result<SessionResources, AssistantError> {
        let assistant_id = session
            .assistant_id
            .clone()
            .ok_or_else(|| AssistantError::ResourceNotFound("assistant id missing".into()))?;
        let thread_id = session
            .thread_id
            .clone()
            .ok_or_else(|| AssistantError::ResourceNotFound("thread id missing".into()))?;

        for document_id in &session.document_ids {
            verify(self.provider.document_info(document_id).await, document_id)?;
        }
        verify(self.provider.assistant_info(&assistant_id).await, &assistant_id)?;
        verify(self.provider.thread_info(&thread_id).await, &thread_id)?;

        info!(session_id = %session.id, "session resumed");
        Ok(SessionResources {
            document_ids: session.document_ids.clone(),
            assistant_id,
            thread_id,
        })
    }

    /// Upload the pending local files, create the assistant and thread, and
    /// lock the session atomically with persisting the new ids.
    ///
    /// If the conditional update reports a conflict, another worker won the
    /// race: the freshly created resources are deleted best-effort and the
    /// winner's persisted ids are resumed instead.
    async fn materialize(
        &self,
        session: SessionRecord,
        instructions: Option<&str>,
    ) -> Result<SessionResources, AssistantError> {
        let mut document_ids = Vec::with_capacity(session.local_paths.len());
        for path in &session.local_paths {
            let id = self.provider.upload_document(Path::new(path)).await?;
            info!(session_id = %session.id, document_id = %id, "document uploaded");
            document_ids.push(id);
        }

        let assistant_id = self
            .provider
            .create_assistant(&CreateAssistantRequest::with_instructions(instructions))
            .await?;
        let thread_id = self.provider.create_thread().await?;

        let resources = SessionResources {
            document_ids,
            assistant_id,
            thread_id,
        };

        let locked = LockedResources {
            document_ids: resources.document_ids.clone(),
            assistant_id: resources.assistant_id.clone(),
            thread_id: resources.thread_id.clone(),
        };
        match self.sessions.lock(&session.id, &locked) {
            Ok(()) => {
                info!(session_id = %session.id, "session locked");
                Ok(resources)
            }
            Err(StoreError::Conflict(_)) => {
                warn!(session_id = %session.id, "lost lock race, resuming winner's resources");
                self.release(&resources).await;
                let winner = self.get_session(&session.id)?;
                self.resume(&winner).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run one prompt against the session's thread: attach the documents to
    /// a new message, start a run, and poll it to completion.
    ///
    /// A failed run carrying a parseable rate-limit wait hint is retried
    /// after sleeping exactly the hinted duration, up to `run_retries`
    /// attempts. Exhaustion and unhinted failures are terminal for the
    /// prompt — the outer task retry must not re-run them.
    #[instrument(skip(self, resources, prompt), fields(thread_id = %resources.thread_id))]
    pub async fn query(
        &self,
        resources: &SessionResources,
        prompt: &str,
    ) -> Result<String, AssistantError> {
        self.provider
            .create_message(&resources.thread_id, prompt, &resources.document_ids)
            .await?;

        for attempt in 1..=self.run_retries {
            let run_id = self
                .provider
                .start_run(&resources.thread_id, &resources.assistant_id)
                .await?;

            match self
                .poller
                .until_terminal(|| self.provider.run_status(&run_id))
                .await
            {
                Ok(_) => {
                    let messages = self
                        .provider
                        .list_messages(&resources.thread_id, &run_id)
                        .await?;
                    return Ok(messages.join("\n"));
                }
                Err(PollError::RemoteFailed(detail)) => {
                    match parse_wait_hint(&detail) {
                        Some(wait) => {
                            warn!(attempt, wait_ms = wait.as_millis() as u64, %detail, "run rate limited");
                            tokio::time::sleep(wait).await;
                        }
                        None => return Err(PollError::RemoteFailed(detail).into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AssistantError::RunRetriesExceeded {
            attempts: self.run_retries,
        })
    }

    /// Tear down everything the session references: remote handles, local
    /// files, then the record itself.
    ///
    /// Deletion is best-effort per resource — one failure is logged and the
    /// rest are still attempted, and the record is removed regardless.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn close(&self, session_id: &SessionId) -> Result<(), AssistantError> {
        let session = self.get_session(session_id)?;

        for document_id in &session.document_ids {
            if let Err(e) = self.provider.delete_document(document_id).await {
                warn!(document_id, error = %e, "failed to delete document");
            }
        }
        if let Some(thread_id) = &session.thread_id {
            if let Err(e) = self.provider.delete_thread(thread_id).await {
                warn!(thread_id, error = %e, "failed to delete thread");
            }
        }
        if let Some(assistant_id) = &session.assistant_id {
            if let Err(e) = self.provider.delete_assistant(assistant_id).await {
                warn!(assistant_id, error = %e, "failed to delete assistant");
            }
        }
        for path in &session.local_paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path, error = %e, "failed to delete local file");
            }
        }

        self.sessions.remove(session_id)?;
        info!(session_id = %session_id, "session closed");
        Ok(())
    }

    /// Best-effort deletion of resources created by a lock-race loser.
    async fn release(&self, resources: &SessionResources) {
        for document_id in &resources.document_ids {
            if let Err(e) = self.provider.delete_document(document_id).await {
                warn!(document_id, error = %e, "failed to release document");
            }
        }
        if let Err(e) = self.provider.delete_thread(&resources.thread_id).await {
            warn!(thread_id = %resources.thread_id, error = %e, "failed to release thread");
        }
        if let Err(e) = self.provider.delete_assistant(&resources.assistant_id).await {
            warn!(assistant_id = %resources.assistant_id, error = %e, "failed to release assistant");
        }
    }

    fn get_session(&self, session_id: &SessionId) -> Result<SessionRecord, AssistantError> {
        match self.sessions.get(session_id) {
            Ok(session) => Ok(session),
            Err(StoreError::NotFound(_)) => Err(AssistantError::InvalidSession),
            Err(e) => Err(e.into()),
        }
    }
}

fn verify(result: Result<String, ProviderError>, id: &str) -> Result<(), AssistantError> {
    match result {
        Ok(_) => Ok(()),
        Err(ProviderError::NotFound(_)) => Err(AssistantError::ResourceNotFound(id.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Extract the wait duration from a provider rate-limit message, e.g.
/// `"rate_limit_exceeded: Rate limit reached. Please try again in 17s."`.
/// Returns None when the message carries no parseable hint.
fn parse_wait_hint(message: &str) -> Option<Duration> {
    for segment in message.split(". ") {
        if segment.trim_start().starts_with("Please try again in") {
            let token = segment.split_whitespace().last()?;
            return parse_duration_token(token.trim_end_matches('.'));
        }
    }
    None
}

fn parse_duration_token(token: &str) -> Option<Duration> {
    let secs = if let Some(num) = token.strip_suffix("ms") {
        num.parse::<f64>().ok()? / 1000.0
    } else if let Some(num) = token.strip_suffix('s') {
        num.parse::<f64>().ok()?
    } else if let Some(num) = token.strip_suffix('m') {
        num.parse::<f64>().ok()? * 60.0
    } else {
        return None;
    };
    // Negative, infinite, or NaN hints are provider garbage, not a wait
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_provider::{MockPlatform, PollConfig, RunScript};
    use lectern_store::Database;

    fn fast_poller() -> PollingClient {
        PollingClient::new(PollConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(100),
        })
    }

    struct Fixture {
        platform: Arc<MockPlatform>,
        orchestrator: ResourceOrchestrator,
        sessions: SessionRepo,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let platform = Arc::new(MockPlatform::new());
        let orchestrator = ResourceOrchestrator::new(
            Arc::clone(&platform) as Arc<dyn AssistantProvider>,
            SessionRepo::new(db.clone()),
            fast_poller(),
            DEFAULT_RUN_RETRIES,
        );
        Fixture {
            platform,
            orchestrator,
            sessions: SessionRepo::new(db),
        }
    }

    fn session_with_files(fixture: &Fixture, files: &[&str]) -> SessionId {
        let session = fixture.sessions.create().unwrap();
        for file in files {
            fixture.sessions.append_local_path(&session.id, file).unwrap();
        }
        session.id
    }

    #[tokio::test]
    async fn materialize_locks_and_persists_ids() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/a.pdf", "/tmp/b.pdf"]);

        let resources = fixture.orchestrator.prepare(&session_id, None).await.unwrap();
        assert_eq!(resources.document_ids.len(), 2);

        let persisted = fixture.sessions.get(&session_id).unwrap();
        assert_eq!(persisted.status, SessionStatus::Locked);
        assert_eq!(persisted.document_ids, resources.document_ids);
        assert_eq!(persisted.assistant_id.as_deref(), Some(resources.assistant_id.as_str()));
        assert_eq!(persisted.thread_id.as_deref(), Some(resources.thread_id.as_str()));
    }

    #[tokio::test]
    async fn repeated_prepare_resumes_identical_ids_without_creation() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/a.pdf"]);

        let first = fixture.orchestrator.prepare(&session_id, None).await.unwrap();
        let second = fixture.orchestrator.prepare(&session_id, None).await.unwrap();
        let third = fixture.orchestrator.prepare(&session_id, None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second, third);
        assert!(!first.assistant_id.is_empty());
        assert!(!first.thread_id.is_empty());
        // Creation happened exactly once
        assert_eq!(fixture.platform.call_count("upload_document"), 1);
        assert_eq!(fixture.platform.call_count("create_assistant"), 1);
        assert_eq!(fixture.platform.call_count("create_thread"), 1);
    }

    #[tokio::test]
    async fn resume_with_stale_document_is_resource_not_found() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/a.pdf"]);
        let resources = fixture.orchestrator.prepare(&session_id, None).await.unwrap();

        fixture.platform.forget_document(&resources.document_ids[0]);

        let result = fixture.orchestrator.prepare(&session_id, None).await;
        match result {
            Err(AssistantError::ResourceNotFound(id)) => {
                assert_eq!(id, resources.document_ids[0]);
            }
            other => panic!("expected ResourceNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prepare_unknown_session_is_invalid_session() {
        let fixture = setup();
        let result = fixture
            .orchestrator
            .prepare(&SessionId::from_raw("sess_gone"), None)
            .await;
        assert!(matches!(result, Err(AssistantError::InvalidSession)));
    }

    #[tokio::test]
    async fn lock_race_loser_releases_and_resumes_winner() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/a.pdf"]);

        // Another worker wins the transition before this one's lock lands:
        // seed its resources upstream and lock the record directly.
        fixture.platform.seed_document("doc_winner");
        fixture.platform.seed_assistant("asst_winner");
        fixture.platform.seed_thread("thread_winner");
        // Simulate losing by pre-locking, then calling materialize on the
        // stale active snapshot this worker already read.
        let stale = fixture.sessions.get(&session_id).unwrap();
        fixture
            .sessions
            .lock(
                &session_id,
                &LockedResources {
                    document_ids: vec!["doc_winner".into()],
                    assistant_id: "asst_winner".into(),
                    thread_id: "thread_winner".into(),
                },
            )
            .unwrap();

        let resources = fixture.orchestrator.materialize(stale, None).await.unwrap();

        assert_eq!(resources.document_ids, vec!["doc_winner"]);
        assert_eq!(resources.assistant_id, "asst_winner");
        assert_eq!(resources.thread_id, "thread_winner");
        // The loser's own uploads were released
        assert_eq!(fixture.platform.call_count("delete_document"), 1);
        assert_eq!(fixture.platform.call_count("delete_assistant"), 1);
        assert_eq!(fixture.platform.call_count("delete_thread"), 1);
    }

    #[tokio::test]
    async fn query_returns_run_answer() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/revenue.pdf"]);
        let resources = fixture.orchestrator.prepare(&session_id, None).await.unwrap();

        fixture.platform.push_run(RunScript::completed("Total revenue was $1.2M."));
        let answer = fixture
            .orchestrator
            .query(&resources, "What is the total revenue?")
            .await
            .unwrap();
        assert_eq!(answer, "Total revenue was $1.2M.");

        // The message carried the document attachments
        let calls = fixture.platform.calls();
        assert!(calls.iter().any(|c| c.starts_with("create_message") && c.ends_with("attachments=1")));
    }

    #[tokio::test]
    async fn rate_limited_run_sleeps_hint_and_retries() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/a.pdf"]);
        let resources = fixture.orchestrator.prepare(&session_id, None).await.unwrap();

        fixture.platform.push_run(RunScript::rate_limited("20ms"));
        fixture.platform.push_run(RunScript::completed("recovered"));

        let answer = fixture.orchestrator.query(&resources, "q").await.unwrap();
        assert_eq!(answer, "recovered");
        assert_eq!(fixture.platform.call_count("start_run"), 2);
    }

    #[tokio::test]
    async fn run_retries_exhausted_is_terminal() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/a.pdf"]);
        let resources = fixture.orchestrator.prepare(&session_id, None).await.unwrap();

        fixture.platform.push_run(RunScript::rate_limited("1ms"));
        fixture.platform.push_run(RunScript::rate_limited("1ms"));

        let err = fixture.orchestrator.query(&resources, "q").await.unwrap_err();
        match &err {
            AssistantError::RunRetriesExceeded { attempts } => assert_eq!(*attempts, 2),
            other => panic!("expected RunRetriesExceeded, got {other:?}"),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unhinted_run_failure_surfaces_detail_verbatim() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/a.pdf"]);
        let resources = fixture.orchestrator.prepare(&session_id, None).await.unwrap();

        fixture.platform.push_run(RunScript::failed("server_error: internal"));

        let result = fixture.orchestrator.query(&resources, "q").await;
        match result {
            Err(AssistantError::Poll(PollError::RemoteFailed(detail))) => {
                assert_eq!(detail, "server_error: internal");
            }
            other => panic!("expected RemoteFailed, got {other:?}"),
        }
        // No second run attempt without a wait hint
        assert_eq!(fixture.platform.call_count("start_run"), 1);
    }

    #[tokio::test]
    async fn stalled_run_times_out() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/a.pdf"]);
        let resources = fixture.orchestrator.prepare(&session_id, None).await.unwrap();

        fixture.platform.push_run(RunScript::Stall);

        let result = fixture.orchestrator.query(&resources, "q").await;
        assert!(matches!(result, Err(AssistantError::Poll(PollError::Timeout(_)))));
    }

    #[tokio::test]
    async fn close_deletes_remote_handles_local_files_and_record() {
        let fixture = setup();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.pdf");
        std::fs::write(&file, b"contents").unwrap();

        let session_id = session_with_files(&fixture, &[file.to_str().unwrap()]);
        fixture.orchestrator.prepare(&session_id, None).await.unwrap();

        fixture.orchestrator.close(&session_id).await.unwrap();

        assert!(!file.exists());
        assert_eq!(fixture.platform.call_count("delete_document"), 1);
        assert_eq!(fixture.platform.call_count("delete_thread"), 1);
        assert_eq!(fixture.platform.call_count("delete_assistant"), 1);
        assert!(matches!(
            fixture.sessions.get(&session_id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn close_removes_record_despite_delete_failures() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/a.pdf"]);
        fixture.orchestrator.prepare(&session_id, None).await.unwrap();

        fixture.platform.set_fail_deletes(true);
        fixture.orchestrator.close(&session_id).await.unwrap();

        // All deletions were still attempted
        assert_eq!(fixture.platform.call_count("delete_document"), 1);
        assert_eq!(fixture.platform.call_count("delete_thread"), 1);
        assert_eq!(fixture.platform.call_count("delete_assistant"), 1);
        assert!(matches!(
            fixture.sessions.get(&session_id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn close_unknown_session_is_invalid_session() {
        let fixture = setup();
        let result = fixture.orchestrator.close(&SessionId::from_raw("sess_gone")).await;
        assert!(matches!(result, Err(AssistantError::InvalidSession)));
    }

    #[test]
    fn wait_hint_parsing() {
        let msg = "rate_limit_exceeded: Rate limit reached. Please try again in 17s.";
        assert_eq!(parse_wait_hint(msg), Some(Duration::from_secs(17)));

        let msg = "rate_limit_exceeded: Rate limit reached. Please try again in 820ms.";
        assert_eq!(parse_wait_hint(msg), Some(Duration::from_millis(820)));

        let msg = "rate_limit_exceeded: Rate limit reached. Please try again in 1.5s.";
        assert_eq!(parse_wait_hint(msg), Some(Duration::from_millis(1500)));

        let msg = "rate_limit_exceeded: Rate limit reached. Please try again in 2m.";
        assert_eq!(parse_wait_hint(msg), Some(Duration::from_secs(120)));

        assert_eq!(parse_wait_hint("server_error: internal"), None);
        assert_eq!(parse_wait_hint("Please try again in soon"), None);
    }

    #[test]
    fn hostile_wait_hints_are_rejected_not_panicked() {
        let msg = "rate_limit_exceeded: Rate limit reached. Please try again in -5s.";
        assert_eq!(parse_wait_hint(msg), None);

        let msg = "rate_limit_exceeded: Rate limit reached. Please try again in 1e400s.";
        assert_eq!(parse_wait_hint(msg), None);

        let msg = "rate_limit_exceeded: Rate limit reached. Please try again in NaNms.";
        assert_eq!(parse_wait_hint(msg), None);
    }

    #[tokio::test]
    async fn malformed_wait_hint_surfaces_failure_instead_of_retrying() {
        let fixture = setup();
        let session_id = session_with_files(&fixture, &["/tmp/a.pdf"]);
        let resources = fixture.orchestrator.prepare(&session_id, None).await.unwrap();

        fixture.platform.push_run(RunScript::failed(
            "rate_limit_exceeded: Rate limit reached. Please try again in -5s.",
        ));

        let result = fixture.orchestrator.query(&resources, "q").await;
        match result {
            Err(AssistantError::Poll(PollError::RemoteFailed(detail))) => {
                assert!(detail.contains("-5s"));
            }
            other => panic!("expected RemoteFailed, got {other:?}"),
        }
        assert_eq!(fixture.platform.call_count("start_run"), 1);
    }
}
