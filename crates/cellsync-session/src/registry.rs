//! Notebook sessions: one interpreter, execution queue and pair of output
//! sinks per open notebook.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use cellsync_core::{
    BufferedSink, CellId, NotebookId, PeerSlot, ProgressForwarder, RegistryConfig, SessionHandle,
    UserInput,
    progress::{OutputStream, ProgressSender, progress_channel},
    traits::{InterpreterError, MessageLevel, SessionError, SessionFactory, SessionFuture, SessionIo},
};
use cellsync_executor::{Evaluator, ExecutionQueue, ExecutionResult, INTERRUPT_MESSAGE};
use futures::FutureExt as _;

/// Shown when a cell is submitted to a notebook without a usable session.
pub const SESSION_UNAVAILABLE_MESSAGE: &str =
    "Notebook session unavailable. Please restart the notebook kernel.";

/// Active notebook state.
struct SessionEntry {
    generation: u64,
    session: SessionFuture,
    queue: ExecutionQueue,
    stdout: BufferedSink,
    stderr: BufferedSink,
}

struct Inner {
    factory: Arc<dyn SessionFactory>,
    peer: PeerSlot,
    config: RwLock<RegistryConfig>,
    entries: Mutex<HashMap<NotebookId, Arc<SessionEntry>>>,
    generations: AtomicU64,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<NotebookId, Arc<SessionEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, notebook_id: &str) -> Option<Arc<SessionEntry>> {
        self.entries().get(notebook_id).map(Arc::clone)
    }

    fn is_live(&self, notebook_id: &str, generation: u64) -> bool {
        self.entries()
            .get(notebook_id)
            .is_some_and(|entry| entry.generation == generation)
    }

    fn close(&self, notebook_id: &str) -> bool {
        let removed = self.entries().remove(notebook_id);
        let Some(entry) = removed else {
            return false;
        };

        entry.queue.shutdown();
        if let Some(Ok(session)) = entry.session.peek() {
            session.close();
        }
        for sink in [&entry.stdout, &entry.stderr] {
            if let Err(e) = sink.close() {
                tracing::debug!(notebook_id, stream = ?sink.stream(), "Final flush failed: {e}");
            }
        }
        tracing::info!(notebook_id, "Notebook session closed");
        true
    }
}

/// Startup parameters captured when a session entry is created.
struct Startup {
    registry: Weak<Inner>,
    notebook_id: NotebookId,
    generation: u64,
    config: RegistryConfig,
    events: ProgressSender,
}

impl Startup {
    async fn run(self, io: SessionIo) -> Result<SessionHandle, SessionError> {
        let factory = self
            .registry
            .upgrade()
            .map(|inner| Arc::clone(&inner.factory))
            .ok_or(SessionError::Closed)?;
        let session_config = self.config.notebook.session_config(self.config.project.as_ref());
        let (stdout, stderr) = (io.stdout.clone(), io.stderr.clone());

        let session = factory
            .create(&self.notebook_id, &session_config, io)
            .await
            .inspect_err(|e| {
                tracing::error!(notebook_id = %self.notebook_id, "Failed to create interpreter session: {e}");
            })?;

        // Closed while starting: nobody else will release this session.
        if !self
            .registry
            .upgrade()
            .is_some_and(|inner| inner.is_live(&self.notebook_id, self.generation))
        {
            session.close();
            return Err(SessionError::Closed);
        }

        let registry = self.registry.clone();
        let notebook_id = self.notebook_id.clone();
        session.on_shutdown(Box::new(move || {
            if let Some(inner) = registry.upgrade() {
                tracing::warn!(notebook_id = %notebook_id, "Interpreter shut down");
                inner.close(&notebook_id);
            }
        }));

        let snippets = self.config.notebook.startup_snippets();
        let events = self.events;
        let blocking = Arc::clone(&session);
        let startup = tokio::task::spawn_blocking(move || {
            let evaluator = Evaluator::new(blocking.as_ref(), &events, &stdout, &stderr);
            for snippet in &snippets {
                evaluator.run_silently(snippet)?;
            }
            evaluator.flush();
            Ok::<_, InterpreterError>(())
        })
        .await;

        let failure = match startup {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(message) = failure {
            tracing::error!(notebook_id = %self.notebook_id, "Startup snippets failed: {message}");
            session.close();
            return Err(SessionError::Creation(message));
        }

        tracing::info!(notebook_id = %self.notebook_id, "Interpreter session ready");
        Ok(session)
    }
}

/// Owns every notebook's interpreter session and execution queue.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(factory: Arc<dyn SessionFactory>, peer: PeerSlot, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                peer,
                config: RwLock::new(config),
                entries: Mutex::default(),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> RegistryConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration used by sessions created from now on.
    pub fn update_config(&self, config: RegistryConfig) {
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Session future for `notebook_id`, starting the session if there is none.
    ///
    /// Concurrent calls for the same notebook share one creation. The session
    /// starts even if the returned future is dropped. Must be called inside a
    /// Tokio runtime.
    pub fn create_session(&self, notebook_id: &str) -> SessionFuture {
        let mut entries = self.inner.entries();
        if let Some(entry) = entries.get(notebook_id) {
            return entry.session.clone();
        }

        let config = self.config();
        let generation = self.inner.generations.fetch_add(1, Ordering::AcqRel);
        let (events, rx) = progress_channel();
        ProgressForwarder::new(notebook_id.to_string(), self.inner.peer.clone()).spawn(rx);

        let stdout = BufferedSink::with_config(OutputStream::Stdout, &config.sink, events.clone());
        let stderr = BufferedSink::with_config(OutputStream::Stderr, &config.sink, events.clone());
        let queue = ExecutionQueue::new(
            notebook_id.to_string(),
            events.clone(),
            stdout.clone(),
            stderr.clone(),
        );
        let io = SessionIo {
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            stdin: UserInput::new(self.inner.peer.clone()),
        };

        let startup = Startup {
            registry: Arc::downgrade(&self.inner),
            notebook_id: notebook_id.to_string(),
            generation,
            config,
            events,
        };
        let session = startup.run(io).boxed().shared();
        tokio::spawn(session.clone().map(|_| ()));

        tracing::info!(notebook_id, "Creating interpreter session");
        entries.insert(
            notebook_id.to_string(),
            Arc::new(SessionEntry {
                generation,
                session: session.clone(),
                queue,
                stdout,
                stderr,
            }),
        );
        session
    }

    /// Session future for `notebook_id`, if a session was created.
    #[must_use]
    pub fn session(&self, notebook_id: &str) -> Option<SessionFuture> {
        self.inner.entry(notebook_id).map(|entry| entry.session.clone())
    }

    #[must_use]
    pub fn queue(&self, notebook_id: &str) -> Option<ExecutionQueue> {
        self.inner.entry(notebook_id).map(|entry| entry.queue.clone())
    }

    #[must_use]
    pub fn contains(&self, notebook_id: &str) -> bool {
        self.inner.entries().contains_key(notebook_id)
    }

    #[must_use]
    pub fn notebook_ids(&self) -> Vec<NotebookId> {
        self.inner.entries().keys().cloned().collect()
    }

    /// Run `code` from `cell_id` once the notebook's session is ready.
    ///
    /// The submission is pending from the moment this is called, so an
    /// interrupt while the session is still starting resolves it. Resolves
    /// `Ok(false)` after telling the user when there is no session or it
    /// failed to start.
    pub async fn submit(&self, notebook_id: &str, cell_id: CellId, code: String) -> ExecutionResult {
        let Some(entry) = self.inner.entry(notebook_id) else {
            tracing::warn!(notebook_id, "No session for submitted cell");
            self.session_unavailable().await;
            return Ok(false);
        };

        let mut reservation = entry.queue.reserve(cell_id);
        match entry.session.clone().await {
            Ok(session) => reservation.submit(session, code).await,
            Err(e) => {
                if let Some(outcome) = reservation.resolved() {
                    return outcome;
                }
                drop(reservation);
                tracing::warn!(notebook_id, "Session unusable for submitted cell: {e}");
                self.session_unavailable().await;
                Ok(false)
            }
        }
    }

    async fn session_unavailable(&self) {
        let Some(peer) = self.inner.peer.get() else {
            return;
        };
        if let Err(e) = peer
            .show_message(MessageLevel::Error, SESSION_UNAVAILABLE_MESSAGE.to_string())
            .await
        {
            tracing::warn!("Failed to show message: {e}");
        }
    }

    /// Interrupt whatever the notebook is running and drop its queue.
    pub fn interrupt(&self, notebook_id: &str) -> &'static str {
        let Some(entry) = self.inner.entry(notebook_id) else {
            tracing::debug!(notebook_id, "Interrupt for notebook without session");
            return INTERRUPT_MESSAGE;
        };
        let session = entry
            .session
            .peek()
            .and_then(|result| result.as_ref().ok())
            .cloned();
        entry.queue.interrupt(session.as_deref())
    }

    /// Dispose of the notebook's session. Returns whether one existed.
    pub fn close(&self, notebook_id: &str) -> bool {
        self.inner.close(notebook_id)
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("notebooks", &self.notebook_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cellsync_core::{
        config::ProjectOptions,
        testing::{Script, ScriptedFactory},
    };
    use cellsync_executor::ExecutionError;

    use super::*;

    fn registry(script: Script) -> (SessionRegistry, Arc<ScriptedFactory>) {
        let factory = Arc::new(ScriptedFactory::new(script));
        let registry = SessionRegistry::new(factory.clone(), PeerSlot::new(), RegistryConfig::default());
        (registry, factory)
    }

    #[tokio::test]
    async fn test_concurrent_creation_is_single_flight() {
        let (registry, factory) = registry(Script::new().delay(Duration::from_millis(20)));
        let first = registry.create_session("nb");
        let second = registry.create_session("nb");

        let (a, b) = tokio::join!(first, second);
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(factory.attempts(), 1);
    }

    #[tokio::test]
    async fn test_startup_runs_default_imports() {
        let (registry, factory) = registry(Script::new());
        tokio_test::assert_ok!(registry.create_session("nb").await);

        let interpreter = factory.interpreter("nb").unwrap();
        assert_eq!(
            interpreter.evaluated(),
            ["import java.util.*", "import java.io.*", "import java.math.*"]
        );
    }

    #[tokio::test]
    async fn test_creation_failure_is_shared() {
        let (registry, factory) = registry(Script::new().fail_with("no jdk"));
        let result = registry.create_session("nb").await;
        assert_eq!(result.err(), Some(SessionError::Creation("no jdk".into())));
        assert_eq!(
            registry.submit("nb", "c1".into(), "print a;".into()).await,
            Ok(false)
        );
        assert_eq!(factory.attempts(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (registry, factory) = registry(Script::new());
        registry.create_session("nb").await.unwrap();

        assert!(registry.close("nb"));
        assert!(!registry.close("nb"));
        assert!(factory.interpreter("nb").unwrap().is_closed());
        assert!(registry.session("nb").is_none());
    }

    #[tokio::test]
    async fn test_close_during_creation_releases_session() {
        let (registry, factory) = registry(Script::new().delay(Duration::from_millis(20)));
        let session = registry.create_session("nb");
        assert!(registry.close("nb"));

        assert_eq!(session.await.err(), Some(SessionError::Closed));
        assert!(factory.interpreter("nb").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_update_config_applies_to_new_sessions() {
        let (registry, factory) = registry(Script::new());
        let mut config = RegistryConfig::default();
        config.notebook.class_path = Some("/lib/a.jar".into());
        registry.update_config(config.clone());
        assert_eq!(registry.config(), config);

        registry.create_session("nb").await.unwrap();
        let interpreter = factory.interpreter("nb").unwrap();
        assert!(
            interpreter
                .config()
                .compiler_options
                .windows(2)
                .any(|pair| pair == ["--class-path", "/lib/a.jar"])
        );
    }

    #[tokio::test]
    async fn test_project_options_reach_session() {
        let (registry, factory) = registry(Script::new());
        registry.update_config(RegistryConfig {
            project: Some(ProjectOptions {
                compiler_options: vec!["--module-path".into(), "/mods".into()],
                launch_options: vec!["--class-path".into(), "/target/classes".into()],
            }),
            ..RegistryConfig::default()
        });

        registry.create_session("nb").await.unwrap();
        let interpreter = factory.interpreter("nb").unwrap();
        let config = interpreter.config();
        assert_eq!(config.compiler_options, ["--module-path", "/mods"]);
        assert_eq!(config.runtime_options, ["--class-path", "/target/classes"]);
    }

    #[tokio::test]
    async fn test_interrupt_while_starting_resolves_submission() {
        let (registry, factory) = registry(Script::new().delay(Duration::from_millis(100)));
        let starting = registry.create_session("nb");
        let submitted = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.submit("nb", "c1".into(), "print hi;".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(registry.interrupt("nb"), INTERRUPT_MESSAGE);
        assert_eq!(submitted.await.unwrap(), Err(ExecutionError::Interrupted));

        starting.await.unwrap();
        let interpreter = factory.interpreter("nb").unwrap();
        assert!(!interpreter.evaluated().iter().any(|s| s.starts_with("print")));
        assert_eq!(registry.queue("nb").unwrap().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_while_starting_resolves_submission() {
        let (registry, _factory) = registry(Script::new().delay(Duration::from_millis(100)));
        let starting = registry.create_session("nb");
        let submitted = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.submit("nb", "c1".into(), "print hi;".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(registry.close("nb"));
        assert_eq!(submitted.await.unwrap(), Err(ExecutionError::SessionClosed));
        assert_eq!(starting.await.err(), Some(SessionError::Closed));
    }
}
