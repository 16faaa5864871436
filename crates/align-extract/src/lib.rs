use std::error::Error;
use std::fmt;

use serde_json::Value;

const EXCERPT_LEN: usize = 120;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractError {
    message: String,
    excerpt: String,
}

impl ExtractError {
    fn new(message: impl Into<String>, raw: &str) -> Self {
        Self {
            message: message.into(),
            excerpt: excerpt_of(raw),
        }
    }

    pub fn excerpt(&self) -> &str {
        &self.excerpt
    }
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}; response began: {:?}", self.message, self.excerpt)
    }
}

impl Error for ExtractError {}

fn excerpt_of(raw: &str) -> String {
    raw.trim_start().chars().take(EXCERPT_LEN).collect()
}

/// Extracts a structured value (object or array) from raw model text.
///
/// Strategies are tried in order of cost, returning on the first success:
/// a strict parse of the whole string (with an immediate repaired retry),
/// the contents of any markdown code fences, the first bracket-delimited
/// span, and finally all of the above on a control-character-sanitized copy.
pub fn extract_structured(raw: &str) -> Result<Value, ExtractError> {
    if let Some(value) = parse_or_repair(raw) {
        return Ok(value);
    }

    for block in fenced_blocks(raw) {
        if let Some(value) = parse_or_repair(block) {
            return Ok(value);
        }
    }

    if let Some(slice) = bracket_slice(raw)
        && let Some(value) = parse_or_repair(slice)
    {
        return Ok(value);
    }

    let sanitized = strip_control_chars(raw);
    if sanitized != raw {
        if let Some(value) = parse_or_repair(&sanitized) {
            return Ok(value);
        }
        if let Some(slice) = bracket_slice(&sanitized)
            && let Some(value) = parse_or_repair(slice)
        {
            return Ok(value);
        }
    }

    Err(ExtractError::new(
        "no parseable structured payload found",
        raw,
    ))
}

fn parse_or_repair(text: &str) -> Option<Value> {
    parse_strict(text).or_else(|| parse_strict(&repair_json(text)))
}

fn parse_strict(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() || value.is_array() => Some(value),
        _ => None,
    }
}

fn fenced_blocks(raw: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut offset = 0;

    while let Some(open) = raw[offset..].find("```") {
        let after_fence = offset + open + 3;
        // anything on the fence line is a language tag; content starts on
        // the next line
        let Some(newline) = raw[after_fence..].find('\n') else {
            break;
        };
        let content_start = after_fence + newline + 1;
        let content_end = match raw[content_start..].find("```") {
            Some(close) => content_start + close,
            None => raw.len(),
        };
        blocks.push(&raw[content_start..content_end]);
        offset = (content_end + 3).min(raw.len());
    }

    blocks
}

fn bracket_slice(raw: &str) -> Option<&str> {
    let open_idx = raw.find(['{', '['])?;
    let close = if raw[open_idx..].starts_with('{') {
        '}'
    } else {
        ']'
    };

    let mut depth = 0i64;
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in raw[open_idx..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[open_idx..open_idx + index + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    // depth matching failed (truncated payload); fall back to the last
    // closing character, then to the remaining tail for repair to finish
    match raw.rfind(close) {
        Some(end) if end > open_idx => Some(&raw[open_idx..=end]),
        _ => Some(&raw[open_idx..]),
    }
}

fn strip_control_chars(raw: &str) -> String {
    raw.chars()
        .filter(|ch| !ch.is_control() || matches!(ch, '\t' | '\n' | '\r'))
        .collect()
}

/// Best-effort structural repair: quotes bare object keys, drops trailing
/// commas, and closes unterminated strings and brackets left by truncation.
fn repair_json(text: &str) -> String {
    let trimmed = text.trim();
    let chars = trimmed.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(trimmed.len() + 8);
    let mut open_stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];

        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            index += 1;
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
                index += 1;
            }
            '{' => {
                open_stack.push('}');
                out.push(ch);
                index += 1;
            }
            '[' => {
                open_stack.push(']');
                out.push(ch);
                index += 1;
            }
            '}' | ']' => {
                if open_stack.last() == Some(&ch) {
                    open_stack.pop();
                }
                out.push(ch);
                index += 1;
            }
            ',' => {
                let mut next = index + 1;
                while next < chars.len() && chars[next].is_whitespace() {
                    next += 1;
                }
                // a comma followed only by a closer or the end of input is
                // dropped
                if next < chars.len() && chars[next] != '}' && chars[next] != ']' {
                    out.push(ch);
                }
                index += 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = index;
                while index < chars.len()
                    && (chars[index].is_alphanumeric()
                        || chars[index] == '_'
                        || chars[index] == '-')
                {
                    index += 1;
                }
                let word = chars[start..index].iter().collect::<String>();

                let mut next = index;
                while next < chars.len() && chars[next].is_whitespace() {
                    next += 1;
                }
                let in_object = open_stack.last() == Some(&'}');
                if in_object && next < chars.len() && chars[next] == ':' {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(&word);
                }
            }
            _ => {
                out.push(ch);
                index += 1;
            }
        }
    }

    if in_string {
        out.push('"');
    }
    while let Some(close) = open_stack.pop() {
        out.push(close);
    }

    out
}
