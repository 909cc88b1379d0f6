//! Case-safe encoding of module paths and versions.
//!
//! Module paths may contain uppercase letters, but the download cache and
//! the proxy protocol must survive case-insensitive filesystems. Every
//! uppercase ASCII letter is therefore written as `!` followed by its
//! lowercase form (`github.com/Azure` becomes `github.com/!azure`). The
//! encoding is a bijection over ASCII input that does not contain `!`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscapeError {
    #[error("{kind} {input:?} contains '!'")]
    Bang { kind: &'static str, input: String },
    #[error("{kind} {input:?} contains non-ASCII characters")]
    NonAscii { kind: &'static str, input: String },
    #[error("escaped {kind} {input:?} contains uppercase letters")]
    Uppercase { kind: &'static str, input: String },
    #[error("escaped {kind} {input:?} has a '!' not followed by a lowercase letter")]
    DanglingBang { kind: &'static str, input: String },
}

pub fn escape_path(path: &str) -> Result<String, EscapeError> {
    escape(path, "module path")
}

pub fn unescape_path(escaped: &str) -> Result<String, EscapeError> {
    unescape(escaped, "module path")
}

pub fn unescape_version(escaped: &str) -> Result<String, EscapeError> {
    unescape(escaped, "version")
}

fn escape(input: &str, kind: &'static str) -> Result<String, EscapeError> {
    let mut out = String::with_capacity(input.len() + 4);
    for c in input.chars() {
        if c == '!' {
            return Err(EscapeError::Bang {
                kind,
                input: input.to_string(),
            });
        }
        if !c.is_ascii() {
            return Err(EscapeError::NonAscii {
                kind,
                input: input.to_string(),
            });
        }
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn unescape(escaped: &str, kind: &'static str) -> Result<String, EscapeError> {
    let mut out = String::with_capacity(escaped.len());
    let mut bang = false;
    for c in escaped.chars() {
        if !c.is_ascii() {
            return Err(EscapeError::NonAscii {
                kind,
                input: escaped.to_string(),
            });
        }
        if bang {
            bang = false;
            if !c.is_ascii_lowercase() {
                return Err(EscapeError::DanglingBang {
                    kind,
                    input: escaped.to_string(),
                });
            }
            out.push(c.to_ascii_uppercase());
            continue;
        }
        match c {
            '!' => bang = true,
            c if c.is_ascii_uppercase() => {
                return Err(EscapeError::Uppercase {
                    kind,
                    input: escaped.to_string(),
                });
            }
            c => out.push(c),
        }
    }
    if bang {
        return Err(EscapeError::DanglingBang {
            kind,
            input: escaped.to_string(),
        });
    }
    Ok(out)
}
