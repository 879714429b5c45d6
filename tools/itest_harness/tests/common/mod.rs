//! Source scanning shared by the run-log lints.
//!
//! Each file is scanned twice over: `text` is the source as written and `code`
//! is the same bytes with comments, literal contents, and `#[cfg(test)]` items
//! blanked to spaces. Structure (braces, commas, `fn`) is read from `code`;
//! literals are read back from `text` at the same offsets.

#![allow(dead_code)]

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

pub const LOG_FN: &str = "append_run_log";

pub struct SourceFile {
    pub relative: String,
    pub text: String,
    pub code: String,
}

impl SourceFile {
    pub fn parse(relative: &str, text: &str) -> Self {
        let code = blank_test_items(&mask(text));
        Self {
            relative: relative.to_string(),
            text: text.to_string(),
            code,
        }
    }

    pub fn line_of(&self, offset: usize) -> usize {
        self.text[..offset].bytes().filter(|b| *b == b'\n').count() + 1
    }
}

/// Every `.rs` file under the crate's `src/`, sorted by path.
pub fn crate_sources() -> Vec<SourceFile> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut paths = Vec::new();
    walk(&root, &mut paths);
    paths.sort();
    paths
        .iter()
        .map(|path| {
            let relative = path
                .strip_prefix(&root)
                .expect("under src")
                .to_string_lossy()
                .replace('\\', "/");
            let text = fs::read_to_string(path).expect("read source");
            SourceFile::parse(&relative, &text)
        })
        .collect()
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in fs::read_dir(dir).expect("read dir") {
        let path = entry.expect("dir entry").path();
        if path.is_dir() {
            walk(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

pub struct FunctionSpan {
    pub name: String,
    pub line: usize,
    pub signature: String,
    pub body: Range<usize>,
}

impl FunctionSpan {
    /// Body lines holding more than punctuation.
    pub fn significant_lines(&self, file: &SourceFile) -> usize {
        file.code[self.body.clone()]
            .lines()
            .filter(|line| line.bytes().any(|b| b.is_ascii_alphanumeric()))
            .count()
    }
}

/// Functions with a body, outermost only. Signatures may span lines.
pub fn functions(file: &SourceFile) -> Vec<FunctionSpan> {
    let code = file.code.as_bytes();
    let mut found = Vec::new();
    let mut at = 0;
    while let Some(start) = find_word(&file.code, "fn", at) {
        at = start + 2;
        let name_start = skip_spaces(code, at);
        let name_end = ident_end(code, name_start);
        if name_end == name_start {
            continue;
        }
        let Some(open) = code[name_end..]
            .iter()
            .position(|b| *b == b'{' || *b == b';')
            .map(|n| n + name_end)
        else {
            break;
        };
        if code[open] == b';' {
            at = open + 1;
            continue;
        }
        let close = matching(code, open).expect("balanced braces");
        found.push(FunctionSpan {
            name: file.code[name_start..name_end].to_string(),
            line: file.line_of(start),
            signature: squash(&file.code[start..open]),
            body: open..close + 1,
        });
        at = close + 1;
    }
    found
}

pub struct LogCall {
    pub line: usize,
    pub args: Vec<Arg>,
}

pub struct Arg {
    pub text: String,
    pub code: String,
}

impl Arg {
    /// Contents of a plain string literal argument.
    pub fn literal(&self) -> Option<&str> {
        self.text
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
    }

    /// Top-level keys of a `json!({ .. })` payload; `None` for anything else.
    pub fn json_object_keys(&self) -> Option<Vec<String>> {
        let inner = self.code.strip_prefix("json!(")?.trim_start();
        if !inner.starts_with('{') {
            return None;
        }
        let open = self.code.len() - inner.len();
        let close = matching(self.code.as_bytes(), open)?;
        let keys = split_top_level(&self.code, open + 1..close)
            .into_iter()
            .filter_map(|entry| {
                let colon = self.code[entry.clone()].find(':')? + entry.start;
                Some(self.text[entry.start..colon].trim().trim_matches('"').to_string())
            })
            .collect();
        Some(keys)
    }
}

/// Calls to the run logger outside test code.
pub fn log_calls(file: &SourceFile) -> Vec<LogCall> {
    let code = file.code.as_bytes();
    let mut calls = Vec::new();
    let mut at = 0;
    while let Some(start) = find_word(&file.code, LOG_FN, at) {
        at = start + LOG_FN.len();
        let is_definition = file.code[..start].trim_end().ends_with("fn");
        if is_definition || code.get(at) != Some(&b'(') {
            continue;
        }
        let close = matching(code, at).expect("balanced parens");
        let args = split_top_level(&file.code, at + 1..close)
            .into_iter()
            .map(|span| {
                let span = trimmed(&file.code, span);
                Arg {
                    text: file.text[span.clone()].to_string(),
                    code: file.code[span].to_string(),
                }
            })
            .collect();
        calls.push(LogCall {
            line: file.line_of(start),
            args,
        });
        at = close;
    }
    calls
}

/// Comma-separated pieces of `range` at nesting depth zero; a trailing comma
/// does not produce an empty piece.
fn split_top_level(code: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let bytes = code.as_bytes();
    let mut pieces = Vec::new();
    let mut depth = 0i32;
    let mut piece_start = range.start;
    for i in range.clone() {
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b',' if depth == 0 => {
                pieces.push(piece_start..i);
                piece_start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(piece_start..range.end);
    pieces.retain(|piece| !code[piece.clone()].trim().is_empty());
    pieces
}

/// `range` without surrounding whitespace, judged on the masked code so the
/// same range slices `text` identically.
fn trimmed(code: &str, range: Range<usize>) -> Range<usize> {
    let piece = &code[range.clone()];
    let start = range.start + (piece.len() - piece.trim_start().len());
    let end = range.end - (piece.len() - piece.trim_end().len());
    start..end.max(start)
}

fn matching(code: &[u8], open: usize) -> Option<usize> {
    let (up, down) = match code[open] {
        b'{' => (b'{', b'}'),
        b'(' => (b'(', b')'),
        b'[' => (b'[', b']'),
        _ => return None,
    };
    let mut depth = 0usize;
    for (i, b) in code.iter().enumerate().skip(open) {
        if *b == up {
            depth += 1;
        } else if *b == down {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

fn find_word(code: &str, word: &str, from: usize) -> Option<usize> {
    let bytes = code.as_bytes();
    let mut from = from;
    while let Some(found) = code.get(from..)?.find(word) {
        let start = from + found;
        let end = start + word.len();
        let before_ok = start == 0 || !is_ident(bytes[start - 1]);
        let after_ok = end >= bytes.len() || !is_ident(bytes[end]);
        if before_ok && after_ok {
            return Some(start);
        }
        from = end;
    }
    None
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn skip_spaces(code: &[u8], mut at: usize) -> usize {
    while at < code.len() && code[at].is_ascii_whitespace() {
        at += 1;
    }
    at
}

fn ident_end(code: &[u8], mut at: usize) -> usize {
    while at < code.len() && is_ident(code[at]) {
        at += 1;
    }
    at
}

fn squash(signature: &str) -> String {
    signature.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Blank comments and the insides of string and char literals. Newlines and
/// byte offsets are preserved; the result is pure ASCII.
pub fn mask(text: &str) -> String {
    let src = text.as_bytes();
    let mut out = src.to_vec();
    let mut i = 0;
    while i < src.len() {
        let rest = &src[i..];
        if rest.starts_with(b"//") {
            let end = i + rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
            blank(&mut out, i..end);
            i = end;
        } else if rest.starts_with(b"/*") {
            let end = i + find_bytes(rest, b"*/").map_or(rest.len(), |n| n + 2);
            blank(&mut out, i..end);
            i = end;
        } else if let Some(hashes) = raw_string_start(src, i) {
            let body = i + 2 + hashes;
            let mut close = vec![b'"'];
            close.extend(std::iter::repeat(b'#').take(hashes));
            let end = find_bytes(&src[body..], &close).map_or(src.len(), |n| body + n);
            blank(&mut out, body..end);
            i = end + close.len();
        } else if src[i] == b'"' {
            let end = string_end(src, i + 1);
            blank(&mut out, i + 1..end);
            i = end + 1;
        } else if src[i] == b'\'' {
            match char_literal_end(text, i) {
                Some(end) => {
                    blank(&mut out, i + 1..end);
                    i = end + 1;
                }
                None => i += 1,
            }
        } else {
            i += 1;
        }
    }
    for b in out.iter_mut() {
        if !b.is_ascii() {
            *b = b' ';
        }
    }
    String::from_utf8(out).expect("ascii")
}

fn blank(out: &mut [u8], range: Range<usize>) {
    let len = out.len();
    for b in &mut out[range.start.min(len)..range.end.min(len)] {
        if *b != b'\n' {
            *b = b' ';
        }
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Number of `#` marks when a raw string literal starts at `i`.
fn raw_string_start(src: &[u8], i: usize) -> Option<usize> {
    if src[i] != b'r' {
        return None;
    }
    let prefix_ok = match i.checked_sub(1).map(|p| src[p]) {
        None => true,
        Some(b'b') => i < 2 || !is_ident(src[i - 2]),
        Some(prev) => !is_ident(prev),
    };
    if !prefix_ok {
        return None;
    }
    let hashes = src[i + 1..].iter().take_while(|b| **b == b'#').count();
    (src.get(i + 1 + hashes) == Some(&b'"')).then_some(hashes)
}

fn string_end(src: &[u8], mut i: usize) -> usize {
    while i < src.len() {
        match src[i] {
            b'\\' => i += 2,
            b'"' => return i,
            _ => i += 1,
        }
    }
    src.len()
}

/// Closing quote of a char literal at `i`, or `None` for a lifetime.
fn char_literal_end(text: &str, i: usize) -> Option<usize> {
    let src = text.as_bytes();
    if src.get(i + 1) == Some(&b'\\') {
        return src
            .get(i + 3..)?
            .iter()
            .position(|b| *b == b'\'')
            .map(|n| i + 3 + n);
    }
    let ch = text.get(i + 1..)?.chars().next()?;
    let close = i + 1 + ch.len_utf8();
    (src.get(close) == Some(&b'\'')).then_some(close)
}

/// Blank every item annotated `#[cfg(test)]`, attribute included.
fn blank_test_items(code: &str) -> String {
    const ATTR: &str = "#[cfg(test)]";
    let mut out = code.as_bytes().to_vec();
    let mut at = 0;
    while let Some(found) = code[at..].find(ATTR) {
        let start = at + found;
        let Some(open) = code[start..]
            .find(|c: char| c == '{' || c == ';')
            .map(|n| start + n)
        else {
            break;
        };
        let end = if out[open] == b'{' {
            matching(code.as_bytes(), open).unwrap_or(code.len() - 1)
        } else {
            open
        };
        blank(&mut out, start..end + 1);
        at = end + 1;
    }
    String::from_utf8(out).expect("ascii")
}
