//! Statement classifier: decides whether caller-supplied SQL is a single
//! statement without parsing it.
//!
//! The scan is one left-to-right pass over the text that tracks just enough
//! lexical context to know when a `;` is a real statement boundary:
//!
//! - `-- line comments` (to end of line)
//! - `/* block comments */` (not nested; an unterminated one swallows the rest)
//! - `'single quoted'` literals with `''` escaping, and `E'...'` literals with
//!   backslash escaping
//! - `"double quoted"` identifiers
//! - `$tag$ dollar quoted $tag$` bodies (the tag may be empty; an
//!   unterminated body swallows the rest)
//!
//! A `;` outside those contexts makes the text multi-statement as soon as any
//! non-whitespace character follows it, comments included.
//!
//! # Limitations
//!
//! This is a defense layer, not a parser. Dollar-quoted bodies close at the
//! first reappearance of the identical delimiter; nested bodies that reuse the
//! outer tag are not understood. Unterminated comments and bodies classify as
//! single-statement because nothing after them can execute; the read-only
//! transaction wrapping every call is the actual backstop.
//!
//! # Examples
//!
//! ```
//! use sqlgate_rdbc::classifier::is_single_statement;
//!
//! assert!(is_single_statement("SELECT 1;"));
//! assert!(is_single_statement("SELECT ';' AS semi"));
//! assert!(!is_single_statement("SELECT 1; DROP TABLE users"));
//! ```

/// Lexical context of the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Executable text, where `;` is a boundary
    Normal,
    /// Inside `-- ...` up to end of line
    LineComment,
    /// Inside `/* ... */`
    BlockComment,
    /// Inside `'...'`; `escapes` is true for `E'...'` literals
    SingleQuoted { escapes: bool },
    /// Inside `"..."`
    DoubleQuoted,
    /// Inside a dollar-quoted body opened by the delimiter at `tag_start..tag_start + tag_len`
    DollarQuoted { tag_start: usize, tag_len: usize },
}

/// Verdict of [`classify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementShape {
    /// No statement boundary is followed by more content
    Single,
    /// A boundary at this byte offset is followed by more content
    Multiple {
        /// Byte offset of the offending `;`
        boundary: usize,
    },
}

impl StatementShape {
    /// Whether the text is a single statement
    #[inline]
    pub const fn is_single(self) -> bool {
        matches!(self, Self::Single)
    }
}

/// Returns true when `sql` holds at most one statement.
///
/// Total and pure: never fails, never allocates.
#[inline]
pub fn is_single_statement(sql: &str) -> bool {
    classify(sql).is_single()
}

/// Classify `sql`, reporting where the first offending boundary sits.
pub fn classify(sql: &str) -> StatementShape {
    let bytes = sql.as_bytes();
    let mut state = ScanState::Normal;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match state {
            ScanState::Normal => match b {
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    state = ScanState::LineComment;
                    i += 2;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    state = ScanState::BlockComment;
                    i += 2;
                }
                b'\'' => {
                    state = ScanState::SingleQuoted {
                        escapes: is_escape_string_prefix(bytes, i),
                    };
                    i += 1;
                }
                b'"' => {
                    state = ScanState::DoubleQuoted;
                    i += 1;
                }
                b'$' => match dollar_tag_len(bytes, i) {
                    Some(tag_len) => {
                        state = ScanState::DollarQuoted {
                            tag_start: i,
                            tag_len,
                        };
                        i += tag_len;
                    }
                    None => i += 1,
                },
                b';' => {
                    // ';' is ASCII, so i + 1 is a char boundary
                    if sql[i + 1..].trim().is_empty() {
                        return StatementShape::Single;
                    }
                    return StatementShape::Multiple { boundary: i };
                }
                _ => i += 1,
            },
            ScanState::LineComment => {
                if b == b'\n' || b == b'\r' {
                    state = ScanState::Normal;
                }
                i += 1;
            }
            ScanState::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = ScanState::Normal;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            ScanState::SingleQuoted { escapes } => {
                if escapes && b == b'\\' {
                    i += 2;
                } else if b == b'\'' {
                    if bytes.get(i + 1) == Some(&b'\'') {
                        i += 2;
                    } else {
                        state = ScanState::Normal;
                        i += 1;
                    }
                } else {
                    i += 1;
                }
            }
            ScanState::DoubleQuoted => {
                if b == b'"' {
                    state = ScanState::Normal;
                }
                i += 1;
            }
            ScanState::DollarQuoted { tag_start, tag_len } => {
                let tag = &sql[tag_start..tag_start + tag_len];
                match sql[i..].find(tag) {
                    Some(offset) => {
                        state = ScanState::Normal;
                        i += offset + tag_len;
                    }
                    // unterminated body: nothing after it can execute
                    None => return StatementShape::Single,
                }
            }
        }
    }

    StatementShape::Single
}

/// Length of a `$tag$` delimiter starting at `start`, if one starts there.
///
/// The tag is empty or an identifier that does not start with a digit, so
/// positional parameters like `$1` never open a body. A `$` glued to a
/// preceding identifier character is part of that identifier.
fn dollar_tag_len(bytes: &[u8], start: usize) -> Option<usize> {
    if start > 0 && is_ident_continue(bytes[start - 1]) {
        return None;
    }

    let mut end = start + 1;
    if let Some(&first) = bytes.get(end) {
        if first != b'$' && !is_ident_start(first) {
            return None;
        }
    }

    while end < bytes.len() {
        match bytes[end] {
            b'$' => return Some(end - start + 1),
            c if is_ident_continue(c) => end += 1,
            _ => return None,
        }
    }

    None
}

/// Whether the quote at `quote` opens an `E'...'` literal
fn is_escape_string_prefix(bytes: &[u8], quote: usize) -> bool {
    if quote == 0 || !matches!(bytes[quote - 1], b'E' | b'e') {
        return false;
    }
    quote < 2 || !is_ident_continue(bytes[quote - 2])
}

#[inline]
fn is_ident_start(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphabetic() || b >= 0x80
}

#[inline]
fn is_ident_continue(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit() || b == b'$'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trivial_inputs_are_single() {
        assert!(is_single_statement(""));
        assert!(is_single_statement("   \n\t"));
        assert!(is_single_statement(";"));
        assert!(is_single_statement("SELECT 1"));
        assert!(is_single_statement("SELECT 1;"));
        assert!(is_single_statement("SELECT 1;  \n "));
    }

    #[test]
    fn test_consecutive_boundaries_are_multiple() {
        assert!(!is_single_statement(";;"));
        assert_eq!(classify(";;"), StatementShape::Multiple { boundary: 0 });
    }

    #[test]
    fn test_injection_after_boundary() {
        assert!(!is_single_statement("SELECT 1; DROP TABLE users"));
        assert!(!is_single_statement("SELECT 'x'; DROP TABLE users"));
        assert!(!is_single_statement("SELECT 1; SELECT 2"));
        assert_eq!(
            classify("SELECT 1; SELECT 2"),
            StatementShape::Multiple { boundary: 8 }
        );
    }

    #[test]
    fn test_trailing_comment_after_boundary_counts_as_content() {
        assert!(!is_single_statement("SELECT 1; -- done"));
    }

    #[test]
    fn test_boundaries_inside_literals() {
        assert!(is_single_statement("SELECT 'a;b'"));
        assert!(is_single_statement("SELECT 'it''s; fine'"));
        assert!(is_single_statement(r#"SELECT "weird;name" FROM t"#));
        assert!(is_single_statement("SELECT 1 -- trailing; comment"));
        assert!(is_single_statement("SELECT /* ; */ 1"));
    }

    #[test]
    fn test_line_comment_ends_at_newline() {
        assert!(!is_single_statement("SELECT 1 -- note\n; DROP TABLE t"));
    }

    #[test]
    fn test_unterminated_contexts_are_single() {
        assert!(is_single_statement("SELECT 1 /* ; DROP TABLE t"));
        assert!(is_single_statement("SELECT $$ ; DROP TABLE t"));
        assert!(is_single_statement("SELECT $body$ ; DROP TABLE t"));
    }

    #[test]
    fn test_dollar_quoted_bodies() {
        assert!(is_single_statement("SELECT $$a;b$$"));
        assert!(is_single_statement("SELECT $fn$ x; y $fn$;"));
        assert!(!is_single_statement("SELECT $$a$$; DROP TABLE t"));
        // a different tag does not close the body
        assert!(is_single_statement("SELECT $a$ $b$ ; $a$"));
    }

    #[test]
    fn test_positional_parameters_are_not_openers() {
        assert!(is_single_statement("SELECT * FROM t WHERE a = $1 AND b = $2"));
        assert!(!is_single_statement("SELECT $1; DROP TABLE t"));
    }

    #[test]
    fn test_dollar_inside_identifier_is_not_an_opener() {
        assert!(!is_single_statement("SELECT x$a$; DROP TABLE t"));
    }

    #[test]
    fn test_escape_string_backslash_quote() {
        assert!(!is_single_statement(r"SELECT E'\''; DROP TABLE t; --'"));
        assert!(is_single_statement(r"SELECT E'a\';b'"));
        // a plain literal treats the backslash as an ordinary character
        assert!(!is_single_statement(r"SELECT 'a\'; DROP TABLE t"));
    }

    #[test]
    fn test_multibyte_text() {
        assert!(is_single_statement("SELECT 'héllo; wörld'"));
        assert!(!is_single_statement("SELECT 'é'; SELECT 'ü'"));
        assert!(is_single_statement("SELECT 1;\u{00a0}"));
    }
}
