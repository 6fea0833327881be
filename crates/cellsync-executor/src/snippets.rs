//! Splitting cell source into top-level snippets.

use cellsync_core::InterpreterSession;

/// Split `code` into the complete snippets the interpreter would evaluate one
/// at a time.
///
/// An incomplete trailing remainder is returned as the last element as-is.
#[must_use]
pub fn split_snippets(session: &dyn InterpreterSession, code: &str) -> Vec<String> {
    let mut remaining = code.trim().to_string();
    let mut snippets = Vec::new();

    while !remaining.is_empty() {
        let info = session.analyze_completion(&remaining);
        if !info.is_complete {
            snippets.push(remaining);
            break;
        }
        if info.source.is_empty() {
            // No progress possible; keep the rest as one snippet.
            snippets.push(remaining);
            break;
        }
        snippets.push(info.source);
        remaining = info.remaining.trim().to_string();
    }

    snippets
}

#[cfg(test)]
mod tests {
    use cellsync_core::{
        BufferedSink, PeerSlot, UserInput,
        config::SessionConfig,
        progress::{OutputStream, progress_channel},
        testing::ScriptedInterpreter,
        traits::SessionIo,
    };

    use super::*;

    fn interpreter() -> ScriptedInterpreter {
        let (tx, _rx) = progress_channel();
        ScriptedInterpreter::new(
            SessionConfig::default(),
            SessionIo {
                stdout: BufferedSink::new(OutputStream::Stdout, 64, tx.clone()),
                stderr: BufferedSink::new(OutputStream::Stderr, 64, tx),
                stdin: UserInput::new(PeerSlot::new()),
            },
        )
    }

    #[test]
    fn test_splits_complete_snippets() {
        let session = interpreter();
        let snippets = split_snippets(&session, "  int a = 1;\n  print a;\nint b = 2;  ");
        assert_eq!(snippets, ["int a = 1;", "print a;", "int b = 2;"]);
    }

    #[test]
    fn test_incomplete_tail_is_last() {
        let session = interpreter();
        let snippets = split_snippets(&session, "int a = 1; void f() {");
        assert_eq!(snippets, ["int a = 1;", "void f() {"]);
    }

    #[test]
    fn test_blank_source_has_no_snippets() {
        let session = interpreter();
        assert!(split_snippets(&session, " \n\t ").is_empty());
    }

    #[test]
    fn test_resplitting_joined_snippets_is_stable() {
        let session = interpreter();
        let first = split_snippets(&session, "int a = 1;\nprint a;\nthrow X;");
        let again = split_snippets(&session, &first.concat());
        assert_eq!(first, again);
    }
}
