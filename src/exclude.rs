//! Module path patterns that are always served by the local store.
//!
//! The pattern list has the same shape as `GOPRIVATE`: comma-separated
//! globs, each matched against the leading path elements of a module path.
//! A glob with N slashes is compared with the first N+1 elements of the
//! module path, so `corp.example.com/*` covers every module below
//! `corp.example.com/<repo>` without a trailing `*` swallowing deeper
//! segments.
//!
//! Globs are written in Go's `path.Match` syntax (`[^...]` negation, `\`
//! escapes) and rewritten into [`glob::Pattern`] syntax when parsed.

use std::{iter::Peekable, str::Chars};

use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A parsed exclusion list, fixed for the lifetime of the process.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    raw: String,
    patterns: Vec<PrefixPattern>,
}

#[derive(Debug, Clone)]
struct PrefixPattern {
    slashes: usize,
    pattern: Pattern,
}

impl ExclusionSet {
    /// Parses a comma-separated glob list. Empty entries are skipped and
    /// malformed globs are dropped with a warning.
    pub fn parse(globs: &str) -> Self {
        let patterns = globs
            .split(',')
            .filter(|glob| !glob.is_empty())
            .filter_map(|glob| {
                let parsed = translate_go_glob(glob).and_then(|translated| {
                    Pattern::new(&translated).map_err(|err| err.to_string())
                });
                match parsed {
                    Ok(pattern) => Some(PrefixPattern {
                        slashes: glob.matches('/').count(),
                        pattern,
                    }),
                    Err(error) => {
                        tracing::warn!(
                            pattern = %glob,
                            %error,
                            "ignoring malformed exclude pattern"
                        );
                        None
                    }
                }
            })
            .collect();

        Self {
            raw: globs.to_string(),
            patterns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Reports whether a leading portion of `module` matches any pattern.
    pub fn matches(&self, module: &str) -> bool {
        self.patterns.iter().any(|entry| {
            prefix_elements(module, entry.slashes)
                .is_some_and(|prefix| entry.pattern.matches_with(prefix, MATCH_OPTIONS))
        })
    }
}

/// One-shot form of [`ExclusionSet::matches`].
pub fn globs_match_path(globs: &str, target: &str) -> bool {
    ExclusionSet::parse(globs).matches(target)
}

/// Cuts `target` right before its `(slashes + 1)`-th slash. Returns `None`
/// when `target` has fewer than `slashes` slashes.
fn prefix_elements(target: &str, slashes: usize) -> Option<&str> {
    let mut remaining = slashes;
    for (idx, byte) in target.bytes().enumerate() {
        if byte == b'/' {
            if remaining == 0 {
                return Some(&target[..idx]);
            }
            remaining -= 1;
        }
    }
    (remaining == 0).then_some(target)
}

/// Rewrites a `path.Match` glob for [`Pattern`]. Runs of `*` collapse to one
/// `*`, since neither form crosses a `/`.
fn translate_go_glob(glob: &str) -> Result<String, String> {
    let mut out = String::with_capacity(glob.len() + 4);
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                while chars.next_if_eq(&'*').is_some() {}
                out.push('*');
            }
            '\\' => match chars.next() {
                Some(escaped @ ('*' | '?' | '[' | ']')) => {
                    out.push('[');
                    out.push(escaped);
                    out.push(']');
                }
                Some(escaped) => out.push(escaped),
                None => return Err("trailing backslash".to_string()),
            },
            '[' => translate_class(&mut chars, &mut out)?,
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Consumes a character class after its opening `[`. [`Pattern`] only
/// accepts `]` as the first member and reads a leading `!` as negation, so
/// members are reordered to keep their `path.Match` meaning.
fn translate_class(chars: &mut Peekable<Chars<'_>>, out: &mut String) -> Result<(), String> {
    let negated = chars.next_if_eq(&'^').is_some();
    let mut members: Vec<(char, char)> = Vec::new();
    loop {
        if !members.is_empty() && chars.next_if_eq(&']').is_some() {
            break;
        }
        let lo = class_char(chars)?;
        let hi = if chars.next_if_eq(&'-').is_some() {
            class_char(chars)?
        } else {
            lo
        };
        if hi < lo {
            return Err(format!("reversed character range {lo}-{hi}"));
        }
        members.push((lo, hi));
    }

    let mut body = String::new();
    if members.contains(&(']', ']')) {
        body.push(']');
    }
    let (mut bang, mut dash) = (false, false);
    for &(lo, hi) in &members {
        match (lo, hi) {
            (']', ']') => {}
            ('!', '!') => bang = true,
            ('-', '-') => dash = true,
            _ if lo == hi => body.push(lo),
            _ if [lo, hi].iter().any(|c| matches!(c, ']' | '-')) => {
                return Err(format!("unsupported character range {lo}-{hi}"));
            }
            _ => {
                body.push(lo);
                body.push('-');
                body.push(hi);
            }
        }
    }
    if bang {
        body.push('!');
    }
    if dash {
        body.push('-');
    }

    if !negated && body.starts_with('!') {
        if body == "!" {
            out.push('!');
            return Ok(());
        }
        return Err("unsupported character class of '!' and '-'".to_string());
    }
    out.push('[');
    if negated {
        out.push('!');
    }
    out.push_str(&body);
    out.push(']');
    Ok(())
}

fn class_char(chars: &mut Peekable<Chars<'_>>) -> Result<char, String> {
    match chars.next() {
        None => Err("unterminated character class".to_string()),
        Some(c @ ('-' | ']')) => Err(format!("unescaped '{c}' in character class")),
        Some('\\') => chars.next().ok_or_else(|| "trailing backslash".to_string()),
        Some(c) => Ok(c),
    }
}
