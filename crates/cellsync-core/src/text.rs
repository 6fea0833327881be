//! Line/column arithmetic and range edits over normalized cell text.
//!
//! All functions here expect text whose line endings were already folded to
//! `\n` by [`normalize_line_endings`]. Lines, columns and offsets count
//! Unicode scalar values.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Zero-based position inside a text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: i64,
    pub character: i64,
}

impl Position {
    #[must_use]
    pub const fn new(line: i64, character: i64) -> Self {
        Self { line, character }
    }
}

/// Half-open range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// One incremental edit. A missing range replaces the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEdit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    pub text: String,
}

impl ContentEdit {
    #[must_use]
    pub fn replace(range: Range, text: impl Into<String>) -> Self {
        Self {
            range: Some(range),
            text: text.into(),
        }
    }

    #[must_use]
    pub fn full(text: impl Into<String>) -> Self {
        Self {
            range: None,
            text: text.into(),
        }
    }
}

/// Text patch error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TextError {
    #[error("Invalid range: {0}")]
    InvalidRange(&'static str),
}

fn is_line_break(c: char) -> bool {
    matches!(
        c,
        '\n' | '\u{000B}' | '\u{000C}' | '\r' | '\u{0085}' | '\u{2028}' | '\u{2029}'
    )
}

/// Fold every line terminator variant (`\r\n`, `\r`, vertical tab, form feed,
/// NEL, U+2028, U+2029) into `\n`.
#[must_use]
pub fn normalize_line_endings(text: &str) -> Cow<'_, str> {
    if !text.chars().any(|c| c != '\n' && is_line_break(c)) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push('\n');
        } else if is_line_break(c) {
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Owned variant of [`normalize_line_endings`]; reuses `text` when unchanged.
#[must_use]
pub fn into_normalized(text: String) -> String {
    let folded = match normalize_line_endings(&text) {
        Cow::Owned(folded) => Some(folded),
        Cow::Borrowed(_) => None,
    };
    folded.unwrap_or(text)
}

/// Byte bounds of `line`, excluding its terminating `\n`.
fn line_span(text: &str, line: usize) -> Option<(usize, usize)> {
    let mut start = 0;
    for _ in 0..line {
        start += text[start..].find('\n')? + 1;
    }
    let end = text[start..].find('\n').map_or(text.len(), |i| start + i);
    Some((start, end))
}

/// Byte index of `column` within the line `[start, end)`, clamped to the line.
fn column_byte(text: &str, (start, end): (usize, usize), column: i64) -> usize {
    let column = usize::try_from(column.max(0)).unwrap_or(usize::MAX);
    text[start..end]
        .char_indices()
        .nth(column)
        .map_or(end, |(i, _)| start + i)
}

fn char_count(text: &str) -> usize {
    text.chars().count()
}

/// Offset of `position` in `text`.
///
/// Negative lines clamp to the start, columns clamp to the line length, and a
/// line beyond the last one yields the text length.
#[must_use]
pub fn offset_of(text: &str, position: Position) -> usize {
    let Ok(line) = usize::try_from(position.line) else {
        return 0;
    };
    match line_span(text, line) {
        Some(span) => char_count(&text[..column_byte(text, span, position.character)]),
        None => char_count(text),
    }
}

/// Inverse of [`offset_of`]. Offsets past the end clamp to the text length.
#[must_use]
pub fn position_of(text: &str, offset: i64) -> Position {
    let Ok(offset) = usize::try_from(offset) else {
        return Position::default();
    };

    let mut line = 0;
    let mut column = 0;
    for c in text.chars().take(offset) {
        if c == '\n' {
            line += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    Position::new(line, column)
}

/// Replace the half-open range `[start, end)` of `text` with `replacement`.
///
/// An empty replacement over an empty range returns `text` itself
/// (`Cow::Borrowed` pointing at the input).
///
/// # Errors
/// Returns [`TextError::InvalidRange`] when the range is inverted, starts on a
/// negative line, or names a line the text does not have.
pub fn apply_range_edit<'a>(
    text: &'a str,
    start: Position,
    end: Position,
    replacement: &str,
) -> Result<Cow<'a, str>, TextError> {
    if start.line < 0
        || end.line < start.line
        || (end.line == start.line && end.character < start.character)
    {
        return Err(TextError::InvalidRange("invalid range positions"));
    }

    if replacement.is_empty() && start == end {
        return Ok(Cow::Borrowed(text));
    }

    let start_span = usize::try_from(start.line)
        .ok()
        .and_then(|line| line_span(text, line))
        .ok_or(TextError::InvalidRange("range start out of bounds"))?;
    let prefix_end = column_byte(text, start_span, start.character);

    let end_span = usize::try_from(end.line)
        .ok()
        .and_then(|line| line_span(text, line))
        .ok_or(TextError::InvalidRange("range end out of bounds"))?;
    let suffix_start = column_byte(text, end_span, end.character).max(prefix_end);

    let replacement = normalize_line_endings(replacement);
    let mut result =
        String::with_capacity(prefix_end + replacement.len() + (text.len() - suffix_start));
    result.push_str(&text[..prefix_end]);
    result.push_str(&replacement);
    result.push_str(&text[suffix_start..]);
    Ok(Cow::Owned(result))
}

/// Apply a batch of edits strictly in order, each against the previous result.
///
/// # Errors
/// Returns the first [`TextError`] raised by a ranged edit.
pub fn apply_edits(text: &str, edits: &[ContentEdit]) -> Result<String, TextError> {
    let mut current = Cow::Borrowed(text);
    for edit in edits {
        current = match edit.range {
            Some(range) => Cow::Owned(
                apply_range_edit(&current, range.start, range.end, &edit.text)?.into_owned(),
            ),
            None => Cow::Owned(normalize_line_endings(&edit.text).into_owned()),
        };
    }
    Ok(current.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(line: i64, character: i64) -> Position {
        Position::new(line, character)
    }

    const MULTI_LINE: &str = "abc\n def \nghi jkl\n";

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings(""), "");
        assert!(matches!(normalize_line_endings("a\nb\nc\n"), Cow::Borrowed(_)));
        assert_eq!(normalize_line_endings("a\r\nb\nc\r\n"), "a\nb\nc\n");
        assert_eq!(normalize_line_endings("a\u{2028}b\rc\u{2029}"), "a\nb\nc\n");
        assert_eq!(normalize_line_endings("a\rb\rc\r"), "a\nb\nc\n");
        assert_eq!(normalize_line_endings("a\r\r\nb"), "a\n\nb");
    }

    #[test]
    fn test_offset_of() {
        assert_eq!(offset_of("abc", pos(-1, 0)), 0);
        assert_eq!(offset_of("abc", pos(0, 10)), 3);
        assert_eq!(offset_of("", pos(0, 0)), 0);
        assert_eq!(offset_of("", pos(0, 2)), 0);
        assert_eq!(offset_of("abc", pos(0, 2)), 2);
        assert_eq!(offset_of("abc\n", pos(0, 4)), 3);
        assert_eq!(offset_of("abc\n", pos(1, 0)), 4);
        assert_eq!(offset_of("abc\n", pos(1, 1)), 4);

        assert_eq!(MULTI_LINE.chars().count(), 18);
        assert_eq!(offset_of(MULTI_LINE, pos(1, 0)), 4);
        assert_eq!(offset_of(MULTI_LINE, pos(1, 5)), 9);
        assert_eq!(offset_of(MULTI_LINE, pos(1, 6)), 9);
        assert_eq!(offset_of(MULTI_LINE, pos(2, -1)), 10);
        assert_eq!(offset_of(MULTI_LINE, pos(2, 7)), 17);
        assert_eq!(offset_of(MULTI_LINE, pos(2, 8)), 17);
        assert_eq!(offset_of(MULTI_LINE, pos(3, 0)), 18);
        assert_eq!(offset_of(MULTI_LINE, pos(3, 1)), 18);
        assert_eq!(offset_of(MULTI_LINE, pos(9, 0)), 18);
    }

    #[test]
    fn test_position_of() {
        assert_eq!(position_of("abc", -1), pos(0, 0));
        assert_eq!(position_of("", 0), pos(0, 0));
        assert_eq!(position_of("", 2), pos(0, 0));
        assert_eq!(position_of("abc", 3), pos(0, 3));
        assert_eq!(position_of("abc\n", 3), pos(0, 3));
        assert_eq!(position_of("abc\n", 4), pos(1, 0));
        assert_eq!(position_of(MULTI_LINE, 5), pos(1, 1));
        assert_eq!(position_of(MULTI_LINE, 10), pos(2, 0));
        assert_eq!(position_of(MULTI_LINE, 16), pos(2, 6));
        assert_eq!(position_of(MULTI_LINE, 18), pos(3, 0));
        assert_eq!(position_of(MULTI_LINE, 99), pos(3, 0));
    }

    #[test]
    fn test_offset_position_inverse() {
        for text in ["", "abc", "abc\n", MULTI_LINE, "\n\n", "héllo\nwörld"] {
            for offset in 0..=text.chars().count() {
                let position = position_of(text, offset as i64);
                assert_eq!(offset_of(text, position), offset, "text {text:?} offset {offset}");
            }
        }
    }

    #[test]
    fn test_apply_range_edit_rejects_bad_ranges() {
        let err = |s, e, t: &str| apply_range_edit(t, s, e, "").unwrap_err();
        assert_eq!(
            err(pos(-1, 0), pos(-1, 0), ""),
            TextError::InvalidRange("invalid range positions")
        );
        assert_eq!(
            err(pos(1, 0), pos(0, 0), ""),
            TextError::InvalidRange("invalid range positions")
        );
        assert_eq!(
            err(pos(0, 10), pos(0, 0), ""),
            TextError::InvalidRange("invalid range positions")
        );
        assert_eq!(
            err(pos(1, 0), pos(2, 0), ""),
            TextError::InvalidRange("range start out of bounds")
        );
        assert_eq!(
            err(pos(0, 0), pos(1, 0), "abc"),
            TextError::InvalidRange("range end out of bounds")
        );
    }

    #[test]
    fn test_apply_range_edit_identity_borrows_input() {
        let text = String::from("abc");
        for p in [pos(0, 0), pos(0, 1), pos(0, 3), pos(0, 10)] {
            match apply_range_edit(&text, p, p, "").unwrap() {
                Cow::Borrowed(s) => assert!(std::ptr::eq(s, text.as_str())),
                Cow::Owned(_) => panic!("expected the input to be returned"),
            }
        }
    }

    #[test]
    fn test_apply_range_edit() {
        let apply = |t, s, e, r| apply_range_edit(t, s, e, r).unwrap().into_owned();
        assert_eq!(apply("abc", pos(0, 3), pos(0, 3), "d"), "abcd");
        assert_eq!(apply("abc\n", pos(0, 3), pos(0, 3), "d"), "abcd\n");
        assert_eq!(apply("abc\n", pos(0, 4), pos(0, 6), "d"), "abcd\n");
        assert_eq!(apply("abc\n", pos(1, 0), pos(1, 0), "d"), "abc\nd");
        assert_eq!(apply("abc\n", pos(1, 0), pos(1, 3), "d"), "abc\nd");
        assert_eq!(apply("abc\n", pos(0, 3), pos(1, 0), "d"), "abcd");
        assert_eq!(apply("abc\n", pos(0, 2), pos(0, 3), "d\r\n"), "abd\n\n");
        assert_eq!(
            apply(MULTI_LINE, pos(2, 3), pos(2, 4), "m\n"),
            "abc\n def \nghim\njkl\n"
        );
        assert_eq!(
            apply(MULTI_LINE, pos(3, 0), pos(3, 0), "m\r\n"),
            "abc\n def \nghi jkl\nm\n"
        );
        assert_eq!(
            apply(MULTI_LINE, pos(1, 1), pos(2, 4), "xyz\ndef \nghi\n"),
            "abc\n xyz\ndef \nghi\njkl\n"
        );
        assert_eq!(
            apply("abc\n def \nghi jkl\nmno", pos(3, 1), pos(3, 2), ""),
            "abc\n def \nghi jkl\nmo"
        );
        assert_eq!(apply("naïve", pos(0, 2), pos(0, 3), "i"), "naive");
    }

    #[test]
    fn test_insert_then_delete_round_trip() {
        for offset in 0..=MULTI_LINE.chars().count() {
            let p = position_of(MULTI_LINE, offset as i64);
            let inserted = apply_range_edit(MULTI_LINE, p, p, "X").unwrap().into_owned();
            let after = Position::new(p.line, p.character + 1);
            let restored = apply_range_edit(&inserted, p, after, "").unwrap();
            assert_eq!(restored, MULTI_LINE);
        }
    }

    #[test]
    fn test_apply_edits_in_order() {
        let edits = vec![
            ContentEdit::replace(Range::new(pos(0, 0), pos(0, 0)), "b"),
            ContentEdit::replace(Range::new(pos(0, 2), pos(0, 2)), "c"),
        ];
        assert_eq!(apply_edits("a", &edits).unwrap(), "bac");

        let edits = vec![
            ContentEdit::replace(Range::new(pos(0, 0), pos(0, 1)), "zzz"),
            ContentEdit::full("x\r\ny"),
            ContentEdit::replace(Range::new(pos(1, 1), pos(1, 1)), "!"),
        ];
        assert_eq!(apply_edits("abc", &edits).unwrap(), "x\ny!");
    }

    #[test]
    fn test_apply_edits_propagates_invalid_range() {
        let edits = vec![ContentEdit::replace(Range::new(pos(4, 0), pos(4, 0)), "x")];
        assert!(matches!(
            apply_edits("abc", &edits),
            Err(TextError::InvalidRange(_))
        ));
    }
}
