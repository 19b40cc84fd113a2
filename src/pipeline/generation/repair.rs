//! JSON Repair Engine — recovers a JSON object from near-miss model output.
//!
//! Only used on the unconstrained decoding path. The fixed front half runs
//! in this order: trim, fence removal, preamble stripping, outer wrapper,
//! brace balance, too-short check, parse. The too-short check rejects
//! complete but truncated documents too. Preamble stripping has to come
//! before brace counting, and the leading `{{` collapse must never run
//! once a wrapper brace was added, or it removes the brace it just added.
//!
//! If the candidate still does not parse, an ordered list of
//! [`RepairRule`]s is applied cumulatively until one result parses. New
//! model failure modes get a new rule or preamble pattern, not a new
//! branch in the algorithm.
//!
//! Repair is idempotent: feeding [`RepairOutcome::text`] back in yields the
//! same text and value with no repairs applied.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::types::Stage;

/// Conversational lead-ins seen before the JSON body (matched lowercase).
pub const DEFAULT_PREAMBLES: &[&str] = &[
    "here is the mapping",
    "here's the mapping",
    "based on the provided",
    "based on the document",
    "based on this",
    "here's the",
    "here is the",
    "the following is",
    "below is the",
    "i'll provide",
    "let me provide",
    "sure, here",
    "certainly",
    "looking at the document",
    "from the document",
];

/// Preamble patterns must occur within this many leading characters.
const PREAMBLE_WINDOW: usize = 200;

/// Upper bound on start positions tried by the last-resort extraction.
const MAX_OBJECT_CANDIDATES: usize = 256;

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").expect("valid regex"));
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));
static DUPLICATE_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*,)+").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepairError {
    #[error("Model output is empty")]
    Empty,

    #[error("Model output too short to be a complete document ({len} < {min} characters)")]
    TooShort { len: usize, min: usize },

    #[error("Model output is not valid JSON after repairs: {reason}")]
    Unparseable {
        reason: String,
        attempted: Vec<&'static str>,
    },

    #[error("Model output is valid JSON but not an object")]
    NotAnObject,
}

/// Successful repair.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub value: Map<String, Value>,
    /// The repaired text that parsed.
    pub text: String,
    /// Names of the repairs applied, in order.
    pub repairs: Vec<&'static str>,
    pub wrapper_added: bool,
}

/// A named text-level fix. Returns `None` when it does not apply.
#[derive(Clone, Copy)]
pub struct RepairRule {
    pub name: &'static str,
    apply: fn(&str) -> Option<String>,
}

impl RepairRule {
    pub const fn new(name: &'static str, apply: fn(&str) -> Option<String>) -> Self {
        Self { name, apply }
    }

    pub fn apply(&self, text: &str) -> Option<String> {
        (self.apply)(text)
    }
}

impl std::fmt::Debug for RepairRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RepairRule").field(&self.name).finish()
    }
}

/// Built-in rules, in application order. The last one is a last resort.
pub fn default_rules() -> Vec<RepairRule> {
    vec![
        RepairRule::new("trailing_chatter", drop_trailing_chatter),
        RepairRule::new("trailing_commas", remove_trailing_commas),
        RepairRule::new("duplicate_commas", collapse_duplicate_commas),
        RepairRule::new("unmatched_closers", drop_unmatched_closers),
        RepairRule::new("missing_closers", append_missing_closers),
        RepairRule::new("largest_object", extract_largest_object),
    ]
}

// ═══════════════════════════════════════════════════════════
// RepairEngine
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct RepairEngine {
    min_length: usize,
    preambles: Vec<String>,
    rules: Vec<RepairRule>,
}

impl Default for RepairEngine {
    fn default() -> Self {
        Self {
            min_length: 2,
            preambles: DEFAULT_PREAMBLES.iter().map(|p| p.to_string()).collect(),
            rules: default_rules(),
        }
    }
}

impl RepairEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_stage(stage: Stage) -> Self {
        Self::default().with_min_length(stage.min_output_chars())
    }

    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length;
        self
    }

    pub fn with_preamble(mut self, pattern: &str) -> Self {
        self.preambles.push(pattern.to_lowercase());
        self
    }

    /// Append a rule after the built-in ones.
    pub fn with_rule(mut self, rule: RepairRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[RepairRule] {
        &self.rules
    }

    pub fn repair(&self, raw: &str) -> Result<RepairOutcome, RepairError> {
        let mut repairs: Vec<&'static str> = Vec::new();

        // 1. Trim
        let mut text = raw.trim().to_string();
        if text.is_empty() {
            return Err(RepairError::Empty);
        }

        if !text.starts_with('{') {
            if let Some(inner) = strip_fences(&text) {
                repairs.push("markdown_fence");
                text = inner;
            }
        }

        // 2. Preamble
        if !text.starts_with('{') {
            if let Some(stripped) = self.strip_preamble(&text) {
                repairs.push("preamble");
                text = stripped.to_string();
            }
        }

        // 3. Outer wrapper
        let mut wrapper_added = false;
        if !text.starts_with('{') {
            text.insert(0, '{');
            wrapper_added = true;
            repairs.push("outer_wrapper");
        }

        // 4. Brace balance
        let balance = scan(&text);
        let mut excess = balance.open_braces.saturating_sub(balance.close_braces);
        if excess > 0 && !wrapper_added {
            while excess > 0 && text.starts_with("{{") {
                text.remove(0);
                excess -= 1;
                repairs.push("duplicate_leading_brace");
            }
        }
        if excess > 0 {
            let open = scan(&text);
            if !open.in_string && open.stack.iter().all(|&c| c == '{') {
                text.extend(std::iter::repeat('}').take(open.stack.len()));
                repairs.push("missing_closing_braces");
            }
        }

        // 5. Too-short check, whether or not the candidate parses
        self.check_length(&text)?;

        // 6. Parse
        let first_error = match parse_object(&text) {
            Ok(value) => {
                return Ok(self.finish(value, text, repairs, wrapper_added, raw));
            }
            Err(ParseFailure::NotAnObject) => return Err(RepairError::NotAnObject),
            Err(ParseFailure::Invalid(reason)) => reason,
        };

        let mut last_error = first_error;
        for rule in &self.rules {
            let Some(next) = rule.apply(&text) else {
                continue;
            };
            if next == text {
                continue;
            }
            text = next;
            repairs.push(rule.name);
            match parse_object(&text) {
                Ok(value) => {
                    // Rules may shrink the text below the minimum.
                    self.check_length(&text)?;
                    return Ok(self.finish(value, text, repairs, wrapper_added, raw));
                }
                Err(ParseFailure::NotAnObject) => {
                    last_error = "valid JSON but not an object".to_string();
                }
                Err(ParseFailure::Invalid(reason)) => last_error = reason,
            }
        }

        Err(RepairError::Unparseable {
            reason: last_error,
            attempted: repairs,
        })
    }

    fn check_length(&self, text: &str) -> Result<(), RepairError> {
        let len = text.chars().count();
        if len < self.min_length {
            return Err(RepairError::TooShort {
                len,
                min: self.min_length,
            });
        }
        Ok(())
    }

    fn finish(
        &self,
        value: Map<String, Value>,
        text: String,
        repairs: Vec<&'static str>,
        wrapper_added: bool,
        raw: &str,
    ) -> RepairOutcome {
        if !repairs.is_empty() {
            tracing::info!(
                repairs = ?repairs,
                wrapper_added,
                raw_len = raw.len(),
                "JSON repaired"
            );
        }
        RepairOutcome {
            value,
            text,
            repairs,
            wrapper_added,
        }
    }

    /// Cut everything before the first `{` when a known lead-in precedes it.
    fn strip_preamble<'a>(&self, text: &'a str) -> Option<&'a str> {
        let brace = text.find('{')?;
        let window: String = text[..brace]
            .chars()
            .take(PREAMBLE_WINDOW)
            .collect::<String>()
            .to_lowercase();
        self.preambles
            .iter()
            .any(|p| window.contains(p.as_str()))
            .then(|| &text[brace..])
    }
}

// ═══════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════

enum ParseFailure {
    Invalid(String),
    NotAnObject,
}

fn parse_object(text: &str) -> Result<Map<String, Value>, ParseFailure> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ParseFailure::NotAnObject),
        Err(e) => Err(ParseFailure::Invalid(e.to_string())),
    }
}

fn strip_fences(text: &str) -> Option<String> {
    if !text.contains("```") {
        return None;
    }
    if let Some(caps) = FENCED_BLOCK.captures(text) {
        return caps.get(1).map(|m| m.as_str().trim().to_string());
    }
    // Unterminated fence from a truncated generation.
    text.strip_prefix("```").map(|rest| {
        rest.split_once('\n')
            .map_or(rest, |(_, body)| body)
            .trim()
            .to_string()
    })
}

/// String-aware structural scan.
struct Scan {
    stack: Vec<char>,
    in_string: bool,
    open_braces: usize,
    close_braces: usize,
}

fn scan(text: &str) -> Scan {
    let mut result = Scan {
        stack: Vec::new(),
        in_string: false,
        open_braces: 0,
        close_braces: 0,
    };
    let mut escaped = false;
    for c in text.chars() {
        if result.in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => result.in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => result.in_string = true,
            '{' => {
                result.open_braces += 1;
                result.stack.push('{');
            }
            '[' => result.stack.push('['),
            '}' => {
                result.close_braces += 1;
                result.stack.pop();
            }
            ']' => {
                result.stack.pop();
            }
            _ => {}
        }
    }
    result
}

fn closer_for(opener: char) -> char {
    if opener == '[' {
        ']'
    } else {
        '}'
    }
}

fn drop_trailing_chatter(text: &str) -> Option<String> {
    let end = text.rfind('}')?;
    let tail = &text[end + 1..];
    (!tail.trim().is_empty()).then(|| text[..=end].to_string())
}

fn remove_trailing_commas(text: &str) -> Option<String> {
    TRAILING_COMMA
        .is_match(text)
        .then(|| TRAILING_COMMA.replace_all(text, "$1").into_owned())
}

fn collapse_duplicate_commas(text: &str) -> Option<String> {
    DUPLICATE_COMMA
        .is_match(text)
        .then(|| DUPLICATE_COMMA.replace_all(text, ",").into_owned())
}

fn drop_unmatched_closers(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut dropped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' if depth == 0 => {
                dropped = true;
                continue;
            }
            '}' | ']' => depth -= 1,
            _ => {}
        }
        out.push(c);
    }
    dropped.then(|| out.trim_end().to_string())
}

fn append_missing_closers(text: &str) -> Option<String> {
    let open = scan(text);
    if open.stack.is_empty() && !open.in_string {
        return None;
    }
    let mut out = text.trim_end().to_string();
    if open.in_string {
        out.push('"');
    }
    while out.ends_with(',') {
        out.pop();
        out.truncate(out.trim_end().len());
    }
    if out.ends_with(':') {
        out.push_str(" null");
    }
    out.extend(open.stack.iter().rev().map(|&c| closer_for(c)));
    Some(out)
}

fn extract_largest_object(text: &str) -> Option<String> {
    let mut best: Option<&str> = None;
    for (start, _) in text.match_indices('{').take(MAX_OBJECT_CANDIDATES) {
        let Some(end) = matching_close(&text[start..]) else {
            continue;
        };
        let candidate = &text[start..start + end + 1];
        if best.is_some_and(|b| b.len() >= candidate.len()) {
            continue;
        }
        if parse_object(candidate).is_ok() {
            best = Some(candidate);
        }
    }
    best.filter(|b| b.len() < text.len()).map(str::to_string)
}

/// Byte offset of the `}` closing the object that opens at offset 0.
fn matching_close(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return (c == '}').then_some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
