//! SQL fingerprinting.
//!
//! Turns raw statement text into a canonical form: comments and optimizer hints are
//! dropped, numeric and quoted literals become `?`, and whitespace runs collapse to a
//! single space. The digest is an xxh3 hash of the ASCII-lowercased canonical text, so
//! keyword casing never splits a fingerprint and the value is stable across restarts.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

pub const PLACEHOLDER: char = '?';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Read,
    Write,
    Ddl,
    Transaction,
    Other,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Read => "read",
            QueryType::Write => "write",
            QueryType::Ddl => "ddl",
            QueryType::Transaction => "transaction",
            QueryType::Other => "other",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const READ_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "EXPLAIN"];
const WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "REPLACE", "UPSERT"];
const DDL_KEYWORDS: &[&str] = &["CREATE", "ALTER", "DROP", "TRUNCATE", "RENAME"];
const TRANSACTION_KEYWORDS: &[&str] = &["COMMIT", "ROLLBACK", "BEGIN"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedQuery {
    pub text: String,
    pub digest: String,
    pub query_type: QueryType,
}

/// Normalize, fingerprint and classify a statement. Total over any input.
pub fn normalize(sql: &str) -> NormalizedQuery {
    let text = normalize_text(sql);
    let digest = digest(&text);
    let query_type = classify_normalized(&text);
    NormalizedQuery {
        text,
        digest,
        query_type,
    }
}

/// Hash of already-normalized text.
pub fn digest(normalized: &str) -> String {
    format!("{:016x}", xxh3_64(normalized.to_ascii_lowercase().as_bytes()))
}

/// Classify a statement by its first keyword after comments are removed.
pub fn classify(sql: &str) -> QueryType {
    classify_normalized(&normalize_text(sql))
}

fn classify_normalized(text: &str) -> QueryType {
    let mut words = text
        .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty());

    let Some(first) = words.next() else {
        return QueryType::Other;
    };
    let first = first.to_ascii_uppercase();
    let first = first.as_str();

    if READ_KEYWORDS.contains(&first) {
        QueryType::Read
    } else if WRITE_KEYWORDS.contains(&first) {
        QueryType::Write
    } else if DDL_KEYWORDS.contains(&first) {
        QueryType::Ddl
    } else if TRANSACTION_KEYWORDS.contains(&first) {
        QueryType::Transaction
    } else if first == "START"
        && words
            .next()
            .is_some_and(|w| w.eq_ignore_ascii_case("TRANSACTION"))
    {
        QueryType::Transaction
    } else {
        QueryType::Other
    }
}

/// Collapse newlines, tabs and repeated spaces without touching anything else.
pub fn squash_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

struct Output {
    buf: String,
    pending_space: bool,
}

impl Output {
    fn new(capacity: usize) -> Self {
        Self {
            buf: String::with_capacity(capacity),
            pending_space: false,
        }
    }

    fn space(&mut self) {
        self.pending_space = true;
    }

    fn push(&mut self, c: char) {
        if self.pending_space && !self.buf.is_empty() {
            self.split_trailing_dashes();
            self.buf.push(' ');
        }
        self.pending_space = false;
        self.buf.push(c);
    }

    fn push_str(&mut self, s: &str) {
        let mut chars = s.chars();
        if let Some(first) = chars.next() {
            self.push(first);
            self.buf.extend(chars);
        }
    }

    /// Two minus signs followed by a space or the end would read back as a comment.
    fn split_trailing_dashes(&mut self) {
        if self.buf.ends_with("--") {
            self.buf.insert(self.buf.len() - 1, ' ');
        }
    }

    fn finish(mut self) -> String {
        self.split_trailing_dashes();
        self.buf
    }

    /// True when the next character starts a new token.
    fn at_boundary(&self) -> bool {
        self.pending_space || self.buf.chars().next_back().is_none_or(|c| !is_ident_char(c))
    }
}

pub fn normalize_text(sql: &str) -> String {
    let mut out = Output::new(sql.len());
    let mut chars = sql.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => out.space(),
            '/' if next_is(&mut chars, '*') => {
                chars.next();
                skip_block_comment(&mut chars);
                out.space();
            }
            '-' if next_is(&mut chars, '-') && is_dash_comment(sql, idx) => {
                skip_line(&mut chars);
                out.space();
            }
            '#' => {
                skip_line(&mut chars);
                out.space();
            }
            '\'' | '"' => {
                skip_string(&mut chars, c);
                out.push(PLACEHOLDER);
            }
            '`' => {
                let end = skip_quoted_ident(&mut chars, sql.len());
                out.push_str(&sql[idx..end]);
            }
            c if c.is_ascii_digit() && out.at_boundary() => {
                let end = scan_number(sql, idx, &mut chars);
                if chars.peek().is_some_and(|&(_, n)| is_ident_char(n)) {
                    // Identifiers may start with digits, e.g. `1st_table`.
                    let mut end = end;
                    while let Some(&(i, n)) = chars.peek() {
                        if !is_ident_char(n) {
                            break;
                        }
                        end = i + n.len_utf8();
                        chars.next();
                    }
                    out.push_str(&sql[idx..end]);
                } else {
                    out.push(PLACEHOLDER);
                }
            }
            c => out.push(c),
        }
    }

    out.finish()
}

type Chars<'a> = Peekable<CharIndices<'a>>;

fn next_is(chars: &mut Chars<'_>, expected: char) -> bool {
    chars.peek().is_some_and(|&(_, c)| c == expected)
}

/// MySQL only treats `--` as a comment when followed by whitespace or end of input.
fn is_dash_comment(sql: &str, idx: usize) -> bool {
    sql[idx + 2..]
        .chars()
        .next()
        .is_none_or(|c| c.is_whitespace() || c.is_control())
}

fn skip_block_comment(chars: &mut Chars<'_>) {
    let mut prev = '\0';
    for (_, c) in chars.by_ref() {
        if prev == '*' && c == '/' {
            return;
        }
        prev = c;
    }
}

fn skip_line(chars: &mut Chars<'_>) {
    for (_, c) in chars.by_ref() {
        if c == '\n' {
            return;
        }
    }
}

fn skip_string(chars: &mut Chars<'_>, quote: char) {
    while let Some((_, c)) = chars.next() {
        if c == '\\' {
            chars.next();
        } else if c == quote {
            if next_is(chars, quote) {
                chars.next();
            } else {
                return;
            }
        }
    }
}

/// Returns the byte offset just past the closing backtick.
fn skip_quoted_ident(chars: &mut Chars<'_>, input_len: usize) -> usize {
    let mut end = input_len;
    while let Some((i, c)) = chars.next() {
        end = i + c.len_utf8();
        if c == '`' {
            if next_is(chars, '`') {
                chars.next();
            } else {
                return end;
            }
        }
    }
    end
}

/// Consume a numeric literal starting at `start`; returns the end byte offset.
fn scan_number(sql: &str, start: usize, chars: &mut Chars<'_>) -> usize {
    let bytes = sql.as_bytes();
    let mut end = start + 1;

    if bytes[start] == b'0' && matches!(chars.peek(), Some(&(_, 'x' | 'X'))) {
        let has_hex = bytes
            .get(start + 2)
            .is_some_and(|b| b.is_ascii_hexdigit());
        if has_hex {
            chars.next();
            advance_while(chars, &mut end, |c| c.is_ascii_hexdigit());
            return end;
        }
    }

    advance_while(chars, &mut end, |c| c.is_ascii_digit());

    if next_is(chars, '.') {
        let followed_by_ident = bytes
            .get(end + 1)
            .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_');
        if !followed_by_ident {
            chars.next();
            end += 1;
            advance_while(chars, &mut end, |c| c.is_ascii_digit());
        }
    }

    if matches!(chars.peek(), Some(&(_, 'e' | 'E'))) {
        let exp_digits_at = match bytes.get(end + 1) {
            Some(b'+' | b'-') => end + 2,
            _ => end + 1,
        };
        if bytes.get(exp_digits_at).is_some_and(|b| b.is_ascii_digit()) {
            while let Some(&(i, _)) = chars.peek() {
                if i >= exp_digits_at {
                    break;
                }
                chars.next();
            }
            end = exp_digits_at;
            advance_while(chars, &mut end, |c| c.is_ascii_digit());
        }
    }

    end
}

fn advance_while(chars: &mut Chars<'_>, end: &mut usize, pred: fn(char) -> bool) {
    while let Some(&(i, c)) = chars.peek() {
        if !pred(c) {
            break;
        }
        *end = i + c.len_utf8();
        chars.next();
    }
}
