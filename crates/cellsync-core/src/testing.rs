//! Scripted collaborators for tests.
//!
//! [`MockPeer`] records everything pushed to the editor and answers requests
//! from queues. [`ScriptedInterpreter`] understands a tiny command language,
//! one command per `;`-terminated snippet:
//!
//! | snippet                     | effect                                              |
//! |-----------------------------|-----------------------------------------------------|
//! | `print <text>`              | writes `<text>` to stdout                           |
//! | `eprint <text>`             | writes `<text>` to stderr                           |
//! | `sleep <ms>`                | blocks until the time passes or `abort` is called   |
//! | `input`                     | reads one line from stdin and prints it             |
//! | `throw <Class> [message]`   | evaluates to a thrown `<Class>` hidden in a wrapper |
//! | `void <name>() uses <a,b>`  | method declaration with unresolved dependencies     |
//! | `corrupt`                   | interpreter reports an illegal state                |
//! | `shutdown`                  | interpreter shuts down, running its hooks           |
//! | anything containing `= ;`   | rejected with a compiler diagnostic                 |
//!
//! Anything else evaluates to a valid statement.

use std::{
    collections::{HashMap, VecDeque},
    io::{BufRead as _, BufReader, Write as _},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    CellId, NotebookId,
    config::SessionConfig,
    progress::{ExecutionProgress, ExecutionStatus, OutputStream, ProgressPayload},
    traits::{
        CellContentResponse, CompletionInfo, DeclarationKind, Diagnostic, InterpreterError,
        InterpreterSession, MessageLevel, PeerError, RemotePeer, RuntimeFailure, SessionError,
        SessionFactory, SessionHandle, SessionIo, Snippet, SnippetEvent, SnippetKind,
        SnippetStatus, ThrowableFrame, ThrownError,
    },
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wrapper class the scripted interpreter reports for thrown errors.
pub const WRAPPER_CLASS: &str = "jdk.jshell.EvalException";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Recording remote peer.
pub struct MockPeer {
    connected: AtomicBool,
    cell_contents: Mutex<VecDeque<Result<CellContentResponse, PeerError>>>,
    content_requests: Mutex<Vec<(NotebookId, CellId)>>,
    inputs: Mutex<VecDeque<Option<String>>>,
    input_prompts: Mutex<Vec<String>>,
    progress: Mutex<Vec<ExecutionProgress>>,
    messages: Mutex<Vec<(MessageLevel, String)>>,
    changed: Notify,
}

impl Default for MockPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            cell_contents: Mutex::default(),
            content_requests: Mutex::default(),
            inputs: Mutex::default(),
            input_prompts: Mutex::default(),
            progress: Mutex::default(),
            messages: Mutex::default(),
            changed: Notify::new(),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Queue the answer to the next cell content request.
    pub fn push_cell_content(&self, text: &str, version: i32) {
        lock(&self.cell_contents).push_back(Ok(CellContentResponse {
            text: text.to_string(),
            version,
        }));
    }

    pub fn push_cell_content_error(&self, error: PeerError) {
        lock(&self.cell_contents).push_back(Err(error));
    }

    /// Queue the answer to the next input prompt. `None` dismisses it.
    pub fn push_input(&self, line: Option<&str>) {
        lock(&self.inputs).push_back(line.map(str::to_string));
    }

    #[must_use]
    pub fn content_requests(&self) -> Vec<(NotebookId, CellId)> {
        lock(&self.content_requests).clone()
    }

    #[must_use]
    pub fn input_prompts(&self) -> Vec<String> {
        lock(&self.input_prompts).clone()
    }

    #[must_use]
    pub fn progress(&self) -> Vec<ExecutionProgress> {
        lock(&self.progress).clone()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<(MessageLevel, String)> {
        lock(&self.messages).clone()
    }

    /// Status changes reported for `cell_id`, payload events excluded.
    #[must_use]
    pub fn statuses(&self, cell_id: &str) -> Vec<ExecutionStatus> {
        lock(&self.progress)
            .iter()
            .filter(|p| p.cell_id == cell_id && p.payload.is_none())
            .map(|p| p.status)
            .collect()
    }

    /// Concatenated output of one stream for `cell_id`.
    #[must_use]
    pub fn output(&self, cell_id: &str, stream: OutputStream) -> String {
        lock(&self.progress)
            .iter()
            .filter(|p| p.cell_id == cell_id)
            .filter_map(|p| match &p.payload {
                Some(ProgressPayload::Output(chunk)) if chunk.stream == stream => {
                    Some(String::from_utf8_lossy(&chunk.data).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    /// Error diagnostic lines reported for `cell_id`.
    #[must_use]
    pub fn error_diagnostics(&self, cell_id: &str) -> Vec<String> {
        lock(&self.progress)
            .iter()
            .filter(|p| p.cell_id == cell_id)
            .filter_map(|p| match &p.payload {
                Some(ProgressPayload::ErrorDiagnostics(lines)) => Some(lines.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Wait until `done` holds, re-checking after every recorded call.
    /// Returns `false` on timeout.
    pub async fn wait_until(&self, mut done: impl FnMut(&Self) -> bool) -> bool {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if done(self) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(WAIT_TIMEOUT, wait).await.is_ok()
    }

    /// Wait until `cell_id` has reported a terminal status.
    pub async fn wait_for_terminal(&self, cell_id: &str) -> bool {
        self.wait_until(|peer| peer.statuses(cell_id).iter().any(|s| s.is_terminal()))
            .await
    }
}

#[async_trait]
impl RemotePeer for MockPeer {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn request_cell_content(
        &self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
    ) -> Result<CellContentResponse, PeerError> {
        lock(&self.content_requests).push((notebook_id.clone(), cell_id.clone()));
        self.changed.notify_waiters();
        lock(&self.cell_contents)
            .pop_front()
            .unwrap_or_else(|| Err(PeerError::Request("no scripted cell content".into())))
    }

    async fn report_execution_progress(
        &self,
        progress: ExecutionProgress,
    ) -> Result<(), PeerError> {
        lock(&self.progress).push(progress);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn show_message(&self, level: MessageLevel, message: String) -> Result<(), PeerError> {
        lock(&self.messages).push((level, message));
        self.changed.notify_waiters();
        Ok(())
    }

    async fn request_user_input(&self, prompt: String) -> Result<Option<String>, PeerError> {
        lock(&self.input_prompts).push(prompt);
        self.changed.notify_waiters();
        Ok(lock(&self.inputs).pop_front().flatten())
    }
}

/// Interpreter evaluating the command language described in the module docs.
pub struct ScriptedInterpreter {
    io: SessionIo,
    config: SessionConfig,
    next_id: AtomicU64,
    aborts: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    closed: AtomicBool,
    evaluated: Mutex<Vec<String>>,
    diagnostics: Mutex<HashMap<String, Vec<Diagnostic>>>,
    unresolved: Mutex<HashMap<String, Vec<String>>>,
    shutdown_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ScriptedInterpreter {
    #[must_use]
    pub fn new(config: SessionConfig, io: SessionIo) -> Self {
        Self {
            io,
            config,
            next_id: AtomicU64::new(1),
            aborts: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            evaluated: Mutex::default(),
            diagnostics: Mutex::default(),
            unresolved: Mutex::default(),
            shutdown_hooks: Mutex::default(),
        }
    }

    /// Snippets passed to `evaluate`, in order.
    #[must_use]
    pub fn evaluated(&self) -> Vec<String> {
        lock(&self.evaluated).clone()
    }

    #[must_use]
    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::Acquire)
    }

    /// Highest number of overlapping `evaluate` calls seen.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Simulate the interpreter dying on its own.
    pub fn trigger_shutdown(&self) {
        let hooks = std::mem::take(&mut *lock(&self.shutdown_hooks));
        for hook in hooks {
            hook();
        }
    }

    fn snippet(&self, source: &str, kind: SnippetKind, name: &str) -> Snippet {
        Snippet {
            id: self.next_id.fetch_add(1, Ordering::AcqRel).to_string(),
            source: source.to_string(),
            kind,
            name: name.to_string(),
        }
    }

    fn valid(snippet: Snippet) -> Vec<SnippetEvent> {
        vec![SnippetEvent {
            snippet,
            status: SnippetStatus::Valid,
            value: None,
            failure: None,
        }]
    }

    /// Sleep until `millis` pass, the session closes or an abort arrives.
    fn sleep(&self, millis: u64, epoch: usize) {
        let deadline = Instant::now() + Duration::from_millis(millis);
        while Instant::now() < deadline
            && !self.is_closed()
            && self.aborts.load(Ordering::Acquire) == epoch
        {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn run(&self, source: &str, epoch: usize) -> Result<Vec<SnippetEvent>, InterpreterError> {
        let command = source.trim().trim_end_matches(';').trim();

        if let Some(pos) = source.find("= ;") {
            let snippet = self.snippet(source, SnippetKind::Erroneous, "");
            let at = i64::try_from(source[..pos + 2].chars().count()).unwrap_or(0);
            lock(&self.diagnostics).insert(
                snippet.id.clone(),
                vec![Diagnostic {
                    message: "illegal start of expression".into(),
                    start: at,
                    end: at,
                }],
            );
            return Ok(vec![SnippetEvent {
                snippet,
                status: SnippetStatus::Rejected,
                value: None,
                failure: None,
            }]);
        }

        let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
        let statement = self.snippet(source, SnippetKind::Statement, "");
        match verb {
            "print" | "eprint" => {
                let mut sink = if verb == "print" {
                    self.io.stdout.clone()
                } else {
                    self.io.stderr.clone()
                };
                // Write errors surface as lost output, like a closed stream.
                let _ = sink.write_all(rest.as_bytes());
                Ok(Self::valid(statement))
            }
            "sleep" => {
                self.sleep(rest.parse().unwrap_or(0), epoch);
                Ok(Self::valid(statement))
            }
            "input" => {
                let mut line = String::new();
                let mut stdout = self.io.stdout.clone();
                match BufReader::new(self.io.stdin.clone()).read_line(&mut line) {
                    Ok(_) => {
                        let _ = stdout.write_all(line.as_bytes());
                        Ok(Self::valid(statement))
                    }
                    Err(e) => Ok(vec![SnippetEvent {
                        snippet: statement,
                        status: SnippetStatus::Valid,
                        value: None,
                        failure: Some(RuntimeFailure::Internal {
                            message: Some(e.to_string()),
                            description: "java.io.EOFException".into(),
                        }),
                    }]),
                }
            }
            "throw" => {
                let (class, message) = rest.split_once(' ').unwrap_or((rest, ""));
                let message = (!message.is_empty()).then(|| message.to_string());
                let header = message
                    .as_ref()
                    .map_or_else(|| WRAPPER_CLASS.to_string(), |m| format!("{WRAPPER_CLASS}: {m}"));
                Ok(vec![SnippetEvent {
                    snippet: statement,
                    status: SnippetStatus::Valid,
                    value: None,
                    failure: Some(RuntimeFailure::Thrown(ThrownError {
                        message,
                        stack_trace: format!("{header}\n\tat .(#1:1)\n"),
                        frames: vec![ThrowableFrame {
                            class_name: WRAPPER_CLASS.into(),
                            original_class: Some(class.to_string()),
                            cause: None,
                        }],
                    })),
                }])
            }
            "void" => {
                let name = rest.split('(').next().unwrap_or_default().trim();
                let deps: Vec<String> = rest
                    .split_once(" uses ")
                    .map(|(_, deps)| deps.split(',').map(|d| d.trim().to_string()).collect())
                    .unwrap_or_default();
                let snippet = self.snippet(
                    source,
                    SnippetKind::Declaration(DeclarationKind::Method),
                    name,
                );
                let status = if deps.is_empty() {
                    SnippetStatus::Valid
                } else {
                    lock(&self.unresolved).insert(snippet.id.clone(), deps);
                    SnippetStatus::RecoverableDefined
                };
                Ok(vec![SnippetEvent {
                    snippet,
                    status,
                    value: None,
                    failure: None,
                }])
            }
            "corrupt" => Err(InterpreterError::IllegalState(
                "snippet state is inconsistent".into(),
            )),
            "shutdown" => {
                self.trigger_shutdown();
                Err(InterpreterError::Shutdown)
            }
            _ => Ok(Self::valid(statement)),
        }
    }
}

impl InterpreterSession for ScriptedInterpreter {
    fn analyze_completion(&self, source: &str) -> CompletionInfo {
        match source.find(';') {
            Some(end) => CompletionInfo {
                is_complete: true,
                source: source[..=end].to_string(),
                remaining: source[end + 1..].to_string(),
            },
            None => CompletionInfo {
                is_complete: !source.trim_end().ends_with(['{', '(', ',', '=']),
                source: source.to_string(),
                remaining: String::new(),
            },
        }
    }

    fn evaluate(&self, snippet: &str) -> Result<Vec<SnippetEvent>, InterpreterError> {
        if self.is_closed() {
            return Err(InterpreterError::Shutdown);
        }
        lock(&self.evaluated).push(snippet.to_string());
        let epoch = self.aborts.load(Ordering::Acquire);

        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_active.fetch_max(active, Ordering::AcqRel);
        let result = self.run(snippet, epoch);
        self.active.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn diagnostics(&self, snippet: &Snippet) -> Vec<Diagnostic> {
        lock(&self.diagnostics)
            .get(&snippet.id)
            .cloned()
            .unwrap_or_default()
    }

    fn unresolved_dependencies(&self, snippet: &Snippet) -> Vec<String> {
        lock(&self.unresolved)
            .get(&snippet.id)
            .cloned()
            .unwrap_or_default()
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::AcqRel);
    }

    fn on_shutdown(&self, hook: Box<dyn FnOnce() + Send>) {
        lock(&self.shutdown_hooks).push(hook);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// How a [`ScriptedFactory`] behaves.
#[derive(Debug, Clone, Default)]
pub struct Script {
    delay: Option<Duration>,
    failure: Option<String>,
}

impl Script {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait before finishing each session creation.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every session creation with `message`.
    #[must_use]
    pub fn fail_with(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }
}

/// Factory producing [`ScriptedInterpreter`]s and remembering them.
#[derive(Default)]
pub struct ScriptedFactory {
    script: Script,
    created: Mutex<Vec<(NotebookId, Arc<ScriptedInterpreter>)>>,
    attempts: AtomicUsize,
}

impl ScriptedFactory {
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            script,
            created: Mutex::default(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of `create` calls, including failed ones.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    /// Most recent interpreter created for `notebook_id`.
    #[must_use]
    pub fn interpreter(&self, notebook_id: &str) -> Option<Arc<ScriptedInterpreter>> {
        lock(&self.created)
            .iter()
            .rev()
            .find(|(id, _)| id == notebook_id)
            .map(|(_, interpreter)| Arc::clone(interpreter))
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn create(
        &self,
        notebook_id: &str,
        config: &SessionConfig,
        io: SessionIo,
    ) -> Result<SessionHandle, SessionError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if let Some(delay) = self.script.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.script.failure {
            return Err(SessionError::Creation(message.clone()));
        }
        let interpreter = Arc::new(ScriptedInterpreter::new(config.clone(), io));
        lock(&self.created).push((notebook_id.to_string(), Arc::clone(&interpreter)));
        Ok(interpreter)
    }
}
