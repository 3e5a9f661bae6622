//! Environment variable substitution.
//!
//! The executor serializes a container's full configuration, substitutes
//! `$NAME` and `${NAME}` references through a caller-supplied resolver, and
//! re-materializes the container. Resolution order therefore does not
//! matter: later-added variables may reference earlier-added ones because
//! both are already present in the namespace when substitution runs.
//!
//! Unknown names resolve to the empty string. `$$` escapes a literal `$`.
//! A `${` without a closing brace, or a brace expression that is not a
//! valid name, is a malformed expression and fails the step.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors raised while substituting a template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubstituteError {
    /// `${` with no closing `}`
    #[error("unterminated ${{ expression at byte {position}")]
    Unterminated {
        /// Byte offset of the opening `${`
        position: usize,
    },
    /// Brace expression whose content is not a valid variable name
    #[error("invalid variable reference '${{{expr}}}'")]
    InvalidName {
        /// The offending expression content
        expr: String,
    },
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern"))
}

/// Substitutes variable references in `template` using `resolver`.
pub fn substitute<R>(template: &str, resolver: R) -> Result<String, SubstituteError>
where
    R: Fn(&str) -> String,
{
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            // copy the whole UTF-8 character, not just one byte
            let ch = template[i..].chars().next().expect("in-bounds char");
            out.push(ch);
            i += ch.len_utf8();
            continue;
        }

        match bytes.get(i + 1) {
            Some(b'$') => {
                out.push('$');
                i += 2;
            }
            Some(b'{') => {
                let rest = &template[i + 2..];
                let Some(end) = rest.find('}') else {
                    return Err(SubstituteError::Unterminated { position: i });
                };
                let expr = &rest[..end];
                if !name_re().is_match(expr) {
                    return Err(SubstituteError::InvalidName {
                        expr: expr.to_string(),
                    });
                }
                out.push_str(&resolver(expr));
                i += 2 + end + 1;
            }
            Some(c) if c.is_ascii_alphabetic() || *c == b'_' => {
                let rest = &template[i + 1..];
                let end = rest
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .unwrap_or(rest.len());
                out.push_str(&resolver(&rest[..end]));
                i += 1 + end;
            }
            // lone '$' stays literal
            _ => {
                out.push('$');
                i += 1;
            }
        }
    }

    Ok(out)
}
