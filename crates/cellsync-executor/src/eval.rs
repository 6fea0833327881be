//! Evaluation of one submission, snippet by snippet.

use cellsync_core::{
    BufferedSink, InterpreterSession,
    progress::{ProgressEvent, ProgressSender},
    traits::{InterpreterError, SnippetEvent, SnippetStatus},
};

use crate::{
    diagnostics::{render_diagnostic, runtime_errors, unresolved_dependency_message},
    snippets::split_snippets,
};

/// Summary of an evaluation that ran to completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalReport {
    pub snippets: usize,
    /// A snippet was rejected or threw.
    pub had_errors: bool,
}

/// Runs source against an interpreter, streaming diagnostics as it goes.
pub struct Evaluator<'a> {
    session: &'a dyn InterpreterSession,
    events: &'a ProgressSender,
    stdout: &'a BufferedSink,
    stderr: &'a BufferedSink,
}

impl<'a> Evaluator<'a> {
    #[must_use]
    pub const fn new(
        session: &'a dyn InterpreterSession,
        events: &'a ProgressSender,
        stdout: &'a BufferedSink,
        stderr: &'a BufferedSink,
    ) -> Self {
        Self {
            session,
            events,
            stdout,
            stderr,
        }
    }

    /// Evaluate every snippet of `code` in order.
    ///
    /// User errors are reported and evaluation continues with the next
    /// snippet. Output is flushed after each snippet, ahead of its diagnostics.
    ///
    /// # Errors
    /// Returns the interpreter error that aborted the evaluation.
    pub fn run(&self, code: &str) -> Result<EvalReport, InterpreterError> {
        let mut report = EvalReport::default();
        for snippet in split_snippets(self.session, code) {
            let events = self.session.evaluate(&snippet)?;
            self.flush();
            for event in &events {
                report.had_errors |= self.report_event(event);
            }
            report.snippets += 1;
        }
        Ok(report)
    }

    /// Evaluate `code` without reporting anything. Used for startup snippets.
    ///
    /// # Errors
    /// Returns the interpreter error that aborted the evaluation.
    pub fn run_silently(&self, code: &str) -> Result<EvalReport, InterpreterError> {
        let mut report = EvalReport::default();
        for snippet in split_snippets(self.session, code) {
            for event in self.session.evaluate(&snippet)? {
                if is_error(&event) {
                    tracing::debug!(snippet = %event.snippet.source, status = ?event.status, "Silent snippet failed");
                    report.had_errors = true;
                }
            }
            report.snippets += 1;
        }
        Ok(report)
    }

    /// Flush both output sinks, logging failures.
    pub fn flush(&self) {
        for sink in [self.stdout, self.stderr] {
            if let Err(e) = sink.flush() {
                tracing::warn!(stream = ?sink.stream(), "Failed to flush output: {e}");
            }
        }
    }

    fn send(&self, lines: Vec<String>, errors: bool) {
        if lines.is_empty() {
            return;
        }
        if self.events.send(ProgressEvent::diagnostics(lines, errors)).is_err() {
            tracing::debug!("Progress receiver gone, dropping diagnostics");
        }
    }

    /// Report one event's runtime errors, compiler diagnostics and unresolved
    /// dependencies. Returns whether the event is an error.
    fn report_event(&self, event: &SnippetEvent) -> bool {
        if let Some(failure) = &event.failure {
            self.send(runtime_errors(failure), true);
        }

        let compile_errors: Vec<String> = self
            .session
            .diagnostics(&event.snippet)
            .iter()
            .flat_map(|diagnostic| render_diagnostic(&event.snippet.source, diagnostic))
            .collect();
        self.send(compile_errors, true);

        let unresolved = self.session.unresolved_dependencies(&event.snippet);
        if let Some(message) = unresolved_dependency_message(event, &unresolved) {
            self.send(vec![message], false);
        }

        is_error(event)
    }
}

fn is_error(event: &SnippetEvent) -> bool {
    event.status == SnippetStatus::Rejected || event.failure.is_some()
}
