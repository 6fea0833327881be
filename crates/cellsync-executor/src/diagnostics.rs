//! Rendering of compiler diagnostics, runtime errors and unresolved
//! dependencies into display lines.

use cellsync_core::traits::{
    DeclarationKind, Diagnostic, RuntimeFailure, SnippetEvent, SnippetKind, ThrownError, TypeKind,
};

fn is_line_break(c: char) -> bool {
    matches!(
        c,
        '\n' | '\u{000B}' | '\u{000C}' | '\r' | '\u{0085}' | '\u{2028}' | '\u{2029}'
    )
}

/// First line break at or after `from`, as `(start, end)` char indices.
fn next_line_break(chars: &[char], from: usize) -> Option<(usize, usize)> {
    let start = from + chars.get(from..)?.iter().position(|&c| is_line_break(c))?;
    let end = if chars[start] == '\r' && chars.get(start + 1) == Some(&'\n') {
        start + 2
    } else {
        start + 1
    };
    Some((start, end))
}

fn to_index(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(usize::MAX)
}

/// Render a diagnostic as its message lines followed by the offending source
/// line and a caret marker under the reported span.
///
/// `location:` lines of the message are dropped. A span that continues past
/// the end of its first line is marked `^---...`.
#[must_use]
pub fn render_diagnostic(source: &str, diagnostic: &Diagnostic) -> Vec<String> {
    let mut lines: Vec<String> = diagnostic
        .message
        .split(is_line_break)
        .filter(|line| !line.trim().starts_with("location:"))
        .map(str::to_string)
        .collect();

    let chars: Vec<char> = source.chars().collect();
    let (start, end) = if diagnostic.start < 0 || diagnostic.end < 0 {
        (0, chars.len())
    } else {
        (to_index(diagnostic.start), to_index(diagnostic.end))
    };

    // Locate the line containing `start`.
    let mut line_start = 0;
    let mut line_end = None;
    while let Some((brk, after)) = next_line_break(&chars, line_start) {
        line_end = Some(brk);
        if brk >= start {
            break;
        }
        line_start = after;
    }
    let line_end = match line_end {
        Some(brk) if brk >= line_start => brk,
        _ => chars.len(),
    };
    lines.push(chars[line_start..line_end].iter().collect());

    let column = start.saturating_sub(line_start);
    let mut marker = " ".repeat(column);
    marker.push('^');
    let multiline = end > line_end;
    let last = (if multiline { line_end } else { end }).saturating_sub(line_start);
    if last > column + 1 {
        marker.push_str(&"-".repeat(last - column - 2));
        marker.push_str(if multiline { "-..." } else { "^" });
    }
    lines.push(marker);

    lines
}

fn declaration_label(kind: DeclarationKind) -> &'static str {
    match kind {
        DeclarationKind::Method => "method",
        DeclarationKind::Variable => "variable",
        DeclarationKind::Type(TypeKind::Class) => "class",
        DeclarationKind::Type(TypeKind::Interface) => "interface",
        DeclarationKind::Type(TypeKind::Enum) => "enum",
        DeclarationKind::Type(TypeKind::Record) => "record",
        DeclarationKind::Type(TypeKind::Annotation) => "annotation interface",
    }
}

/// Informational message for a declaration that references names not yet
/// declared. `None` for non-declarations or when nothing is unresolved.
#[must_use]
pub fn unresolved_dependency_message(event: &SnippetEvent, unresolved: &[String]) -> Option<String> {
    let SnippetKind::Declaration(kind) = event.snippet.kind else {
        return None;
    };
    if unresolved.is_empty() {
        return None;
    }

    let subject = format!("{} {}", declaration_label(kind), event.snippet.name);
    let dependencies = unresolved.join(", ");
    Some(if event.status.is_defined() {
        format!(
            "Created {subject}. However, it cannot be invoked or used or instantiated until {dependencies} is declared"
        )
    } else {
        format!("Created {subject}. However, it cannot be referenced until {dependencies} is declared")
    })
}

/// Display lines for a runtime failure: its message, then the stack trace.
///
/// Internal failures only show their description when they have no message.
#[must_use]
pub fn runtime_errors(failure: &RuntimeFailure) -> Vec<String> {
    let mut errors = Vec::new();
    let (message, details) = match failure {
        RuntimeFailure::Thrown(thrown) => (thrown.message.as_deref(), correct_exception_names(thrown)),
        RuntimeFailure::Internal {
            message,
            description,
        } => {
            let has_message = message.as_deref().is_some_and(|m| !m.trim().is_empty());
            let details = if has_message {
                String::new()
            } else {
                description.clone()
            };
            (message.as_deref(), details)
        }
    };

    if let Some(message) = message.filter(|m| !m.trim().is_empty()) {
        errors.push(message.to_string());
    }
    if !details.trim().is_empty() {
        errors.push(details);
    }
    errors
}

/// The stack trace with each wrapper class name replaced by the class the
/// user code actually threw, following the cause chain.
#[must_use]
pub fn correct_exception_names(error: &ThrownError) -> String {
    let mut output = error.stack_trace.clone();
    if !error.frames.is_empty() {
        correct_from(&mut output, 0, error, 0);
    }
    output
}

fn next_cause(error: &ThrownError, index: Option<usize>) -> Option<usize> {
    index
        .and_then(|i| error.frames.get(i)?.cause)
        .filter(|&cause| cause < error.frames.len())
}

fn correct_from(output: &mut String, from: usize, error: &ThrownError, index: usize) {
    let Some(frame) = error.frames.get(index) else {
        return;
    };
    let Some(actual) = frame.original_class.as_deref() else {
        return;
    };
    let wrapper = frame.class_name.as_str();
    if actual == wrapper {
        return;
    }
    let Some(found) = output.get(from..).and_then(|rest| rest.find(wrapper)) else {
        return;
    };

    let at = from + found;
    output.replace_range(at..at + wrapper.len(), actual);
    let resume = at + actual.len();
    if resume >= output.len() {
        return;
    }

    // Walk to the next wrapper in the cause chain, stopping on cycles.
    let mut cause = Some(index);
    let mut hare = Some(index);
    loop {
        cause = next_cause(error, cause);
        if hare.is_some() {
            hare = next_cause(error, hare);
            if hare.is_some() {
                hare = next_cause(error, hare);
                if hare == cause {
                    cause = None;
                }
            }
        }
        match cause {
            None => return,
            Some(i) if error.frames[i].original_class.is_some() => break,
            Some(_) => {}
        }
    }
    if let Some(next) = cause {
        correct_from(output, resume, error, next);
    }
}

#[cfg(test)]
mod tests {
    use cellsync_core::traits::{Snippet, SnippetStatus, ThrowableFrame};

    use super::*;

    const WRAPPER: &str = "jdk.jshell.EvalException";

    fn diag(message: &str, start: i64, end: i64) -> Diagnostic {
        Diagnostic {
            message: message.into(),
            start,
            end,
        }
    }

    #[test]
    fn test_single_caret() {
        let lines = render_diagnostic("int x = ;", &diag("illegal start of expression", 8, 8));
        assert_eq!(lines, ["illegal start of expression", "int x = ;", "        ^"]);
    }

    #[test]
    fn test_dashed_span_on_one_line() {
        let lines = render_diagnostic("foo(bar);", &diag("cannot find symbol\n  symbol: bar\n  location: class", 4, 7));
        assert_eq!(lines, ["cannot find symbol", "  symbol: bar", "foo(bar);", "    ^-^"]);
    }

    #[test]
    fn test_span_on_second_line() {
        let lines = render_diagnostic("int a = 1;\nString s = 5;", &diag("incompatible types", 22, 23));
        assert_eq!(lines, ["incompatible types", "String s = 5;", "           ^"]);
    }

    #[test]
    fn test_multiline_span_renders_first_line() {
        let lines = render_diagnostic("void f() {\n  return;\n}", &diag("missing return", 0, 20));
        assert_eq!(lines, ["missing return", "void f() {", "^---------..."]);
    }

    #[test]
    fn test_unknown_position_covers_source() {
        let lines = render_diagnostic("abc", &diag("bad", -1, -1));
        assert_eq!(lines, ["bad", "abc", "^-^"]);
    }

    fn declaration(kind: DeclarationKind, name: &str, status: SnippetStatus) -> SnippetEvent {
        SnippetEvent {
            snippet: Snippet {
                id: "1".into(),
                source: String::new(),
                kind: SnippetKind::Declaration(kind),
                name: name.into(),
            },
            status,
            value: None,
            failure: None,
        }
    }

    #[test]
    fn test_unresolved_dependency_messages() {
        let defined = declaration(DeclarationKind::Method, "greet", SnippetStatus::RecoverableDefined);
        assert_eq!(
            unresolved_dependency_message(&defined, &["Person".into(), "format(int)".into()]).unwrap(),
            "Created method greet. However, it cannot be invoked or used or instantiated until Person, format(int) is declared"
        );

        let not_defined = declaration(
            DeclarationKind::Type(TypeKind::Annotation),
            "Tag",
            SnippetStatus::RecoverableNotDefined,
        );
        assert_eq!(
            unresolved_dependency_message(&not_defined, &["Level".into()]).unwrap(),
            "Created annotation interface Tag. However, it cannot be referenced until Level is declared"
        );

        assert!(unresolved_dependency_message(&defined, &[]).is_none());
        let mut statement = defined;
        statement.snippet.kind = SnippetKind::Statement;
        assert!(unresolved_dependency_message(&statement, &["X".into()]).is_none());
    }

    fn wrapper(original: &str, cause: Option<usize>) -> ThrowableFrame {
        ThrowableFrame {
            class_name: WRAPPER.into(),
            original_class: Some(original.into()),
            cause,
        }
    }

    fn plain(class: &str, cause: Option<usize>) -> ThrowableFrame {
        ThrowableFrame {
            class_name: class.into(),
            original_class: None,
            cause,
        }
    }

    #[test]
    fn test_correct_exception_names_follows_causes() {
        let error = ThrownError {
            message: Some("boom".into()),
            stack_trace: format!(
                "{WRAPPER}: boom\n\tat .(#1:1)\nCaused by: java.io.IOException\nCaused by: {WRAPPER}: inner\n"
            ),
            frames: vec![
                wrapper("java.lang.IllegalStateException", Some(1)),
                plain("java.io.IOException", Some(2)),
                wrapper("java.lang.ArithmeticException", None),
            ],
        };
        assert_eq!(
            correct_exception_names(&error),
            "java.lang.IllegalStateException: boom\n\tat .(#1:1)\nCaused by: java.io.IOException\nCaused by: java.lang.ArithmeticException: inner\n"
        );
    }

    #[test]
    fn test_correct_exception_names_survives_cause_cycles() {
        let error = ThrownError {
            message: None,
            stack_trace: format!("{WRAPPER}\n\tat .(#1:1)\nCaused by: a.B\n"),
            frames: vec![wrapper("x.Y", Some(1)), plain("a.B", Some(2)), plain("a.C", Some(1))],
        };
        assert_eq!(
            correct_exception_names(&error),
            "x.Y\n\tat .(#1:1)\nCaused by: a.B\n"
        );

        let self_cause = ThrownError {
            message: None,
            stack_trace: format!("{WRAPPER}\n\tat .(#1:1)\n"),
            frames: vec![wrapper("x.Y", Some(0))],
        };
        assert_eq!(correct_exception_names(&self_cause), "x.Y\n\tat .(#1:1)\n");
    }

    #[test]
    fn test_runtime_errors() {
        let thrown = RuntimeFailure::Thrown(ThrownError {
            message: Some("bad index".into()),
            stack_trace: format!("{WRAPPER}: bad index\n\tat .(#2:1)\n"),
            frames: vec![wrapper("java.lang.IndexOutOfBoundsException", None)],
        });
        assert_eq!(
            runtime_errors(&thrown),
            [
                "bad index".to_string(),
                "java.lang.IndexOutOfBoundsException: bad index\n\tat .(#2:1)\n".to_string()
            ]
        );

        let internal = RuntimeFailure::Internal {
            message: None,
            description: "jdk.jshell.UnresolvedReferenceException".into(),
        };
        assert_eq!(runtime_errors(&internal), ["jdk.jshell.UnresolvedReferenceException"]);

        let internal = RuntimeFailure::Internal {
            message: Some("stopped".into()),
            description: "ignored".into(),
        };
        assert_eq!(runtime_errors(&internal), ["stopped"]);
    }
}
