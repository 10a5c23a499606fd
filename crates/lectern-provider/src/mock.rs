use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;

use lectern_core::errors::ProviderError;
use lectern_core::provider::{AssistantProvider, CreateAssistantRequest, RunPhase, RunState};

/// Scripted outcome for the next started run.
#[derive(Clone, Debug)]
pub enum RunScript {
    /// Run completes; `answer` becomes the assistant message for the run.
    Complete { answer: String },
    /// Run fails with the given remote detail.
    Fail { error: Option<String> },
    /// Run never leaves processing.
    Stall,
}

impl RunScript {
    pub fn completed(answer: &str) -> Self {
        Self::Complete {
            answer: answer.to_string(),
        }
    }

    pub fn failed(detail: &str) -> Self {
        Self::Fail {
            error: Some(detail.to_string()),
        }
    }

    /// A rate-limit failure carrying the provider's wait hint.
    pub fn rate_limited(wait: &str) -> Self {
        Self::Fail {
            error: Some(format!(
                "rate_limit_exceeded: Rate limit reached. Please try again in {wait}."
            )),
        }
    }
}

struct RunRec {
    pending_polls: u32,
    script: RunScript,
}

#[derive(Default)]
struct Inner {
    counter: u64,
    calls: Vec<String>,
    documents: HashSet<String>,
    assistants: HashSet<String>,
    threads: HashSet<String>,
    scripts: VecDeque<RunScript>,
    runs: HashMap<String, RunRec>,
    pending_polls: u32,
    fail_deletes: bool,
}

/// In-memory platform double: call log, scripted run outcomes, canned
/// answers. Backs orchestrator and task tests without HTTP.
#[derive(Default)]
pub struct MockPlatform {
    inner: Mutex<Inner>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for the next started run. Unscripted runs complete
    /// with a canned answer.
    pub fn push_run(&self, script: RunScript) {
        self.inner.lock().scripts.push_back(script);
    }

    /// Number of processing observations before each run turns terminal.
    pub fn set_pending_polls(&self, n: u32) {
        self.inner.lock().pending_polls = n;
    }

    /// Make every delete call fail with a server error.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.inner.lock().fail_deletes = fail;
    }

    /// Seed a remote id as existing (for resume-path tests).
    pub fn seed_document(&self, id: &str) {
        self.inner.lock().documents.insert(id.to_string());
    }

    pub fn seed_assistant(&self, id: &str) {
        self.inner.lock().assistants.insert(id.to_string());
    }

    pub fn seed_thread(&self, id: &str) {
        self.inner.lock().threads.insert(id.to_string());
    }

    /// Drop a remote id, simulating upstream expiry.
    pub fn forget_document(&self, id: &str) {
        self.inner.lock().documents.remove(id);
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn next_id(inner: &mut Inner, prefix: &str) -> String {
        inner.counter += 1;
        format!("{prefix}_{}", inner.counter)
    }

    fn info(&self, set: impl Fn(&Inner) -> bool, call: String, id: &str) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock();
        inner.calls.push(call);
        if set(&inner) {
            Ok(id.to_string())
        } else {
            Err(ProviderError::NotFound(id.to_string()))
        }
    }

    fn delete(
        &self,
        remove: impl Fn(&mut Inner),
        call: String,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        inner.calls.push(call);
        if inner.fail_deletes {
            return Err(ProviderError::ServerError {
                status: 500,
                body: "delete failed".into(),
            });
        }
        remove(&mut inner);
        Ok(())
    }
}

#[async_trait]
impl AssistantProvider for MockPlatform {
    async fn upload_document(&self, path: &Path) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock();
        let id = Self::next_id(&mut inner, "doc");
        inner.calls.push(format!("upload_document {}", path.display()));
        inner.documents.insert(id.clone());
        Ok(id)
    }

    async fn document_info(&self, id: &str) -> Result<String, ProviderError> {
        self.info(
            |inner| inner.documents.contains(id),
            format!("document_info {id}"),
            id,
        )
    }

    async fn delete_document(&self, id: &str) -> Result<(), ProviderError> {
        let call = format!("delete_document {id}");
        let id = id.to_string();
        self.delete(
            move |inner| {
                inner.documents.remove(&id);
            },
            call,
        )
    }

    async fn create_assistant(&self, req: &CreateAssistantRequest) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock();
        let id = Self::next_id(&mut inner, "asst");
        inner.calls.push(format!("create_assistant model={}", req.model));
        inner.assistants.insert(id.clone());
        Ok(id)
    }

    async fn assistant_info(&self, id: &str) -> Result<String, ProviderError> {
        self.info(
            |inner| inner.assistants.contains(id),
            format!("assistant_info {id}"),
            id,
        )
    }

    async fn delete_assistant(&self, id: &str) -> Result<(), ProviderError> {
        let call = format!("delete_assistant {id}");
        let id = id.to_string();
        self.delete(
            move |inner| {
                inner.assistants.remove(&id);
            },
            call,
        )
    }

    async fn create_thread(&self) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock();
        let id = Self::next_id(&mut inner, "thread");
        inner.calls.push("create_thread".to_string());
        inner.threads.insert(id.clone());
        Ok(id)
    }

    async fn thread_info(&self, id: &str) -> Result<String, ProviderError> {
        self.info(
            |inner| inner.threads.contains(id),
            format!("thread_info {id}"),
            id,
        )
    }

    async fn delete_thread(&self, id: &str) -> Result<(), ProviderError> {
        let call = format!("delete_thread {id}");
        let id = id.to_string();
        self.delete(
            move |inner| {
                inner.threads.remove(&id);
            },
            call,
        )
    }

    async fn create_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[String],
    ) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock();
        if !inner.threads.contains(thread_id) {
            inner.calls.push(format!("create_message {thread_id}"));
            return Err(ProviderError::NotFound(thread_id.to_string()));
        }
        let id = Self::next_id(&mut inner, "msg");
        inner.calls.push(format!(
            "create_message {thread_id} content={content} attachments={}",
            attachments.len()
        ));
        Ok(id)
    }

    async fn start_run(&self, thread_id: &str, assistant_id: &str) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock();
        let id = Self::next_id(&mut inner, "run");
        inner.calls.push(format!("start_run {thread_id} {assistant_id}"));
        let script = inner.scripts.pop_front().unwrap_or(RunScript::Complete {
            answer: format!("mock answer for {id}"),
        });
        let pending_polls = inner.pending_polls;
        inner.runs.insert(id.clone(), RunRec { pending_polls, script });
        Ok(id)
    }

    async fn run_status(&self, run_id: &str) -> Result<RunState, ProviderError> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("run_status {run_id}"));
        let rec = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ProviderError::NotFound(run_id.to_string()))?;

        if rec.pending_polls > 0 {
            rec.pending_polls -= 1;
            return Ok(RunState {
                phase: RunPhase::Processing,
                error: None,
            });
        }

        Ok(match &rec.script {
            RunScript::Complete { .. } => RunState {
                phase: RunPhase::Completed,
                error: None,
            },
            RunScript::Fail { error } => RunState {
                phase: RunPhase::Failed,
                error: error.clone(),
            },
            RunScript::Stall => RunState {
                phase: RunPhase::Processing,
                error: None,
            },
        })
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("list_messages {thread_id} {run_id}"));
        match inner.runs.get(run_id).map(|r| &r.script) {
            Some(RunScript::Complete { answer }) => Ok(vec![answer.clone()]),
            Some(_) => Ok(Vec::new()),
            None => Err(ProviderError::NotFound(run_id.to_string())),
        }
    }
}
