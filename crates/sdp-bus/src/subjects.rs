//! Subject namespace and wildcard matching.
//!
//! Grammar: dot-delimited tokens.  `>` as the final token matches any
//! non-empty suffix; `*` matches exactly one token.  Matching is implemented
//! by compiling the subscription pattern to a regex:
//! `>` becomes `.*$`, `*` becomes `[A-Za-z0-9_]+`, every other token is
//! escaped literally.

use crate::BusError;
use regex::Regex;
use uuid::Uuid;

/// Broadcast subject for queries with the wildcard scope.
pub const REQUEST_ALL: &str = "request.all";
/// Cancellation counterpart of [`REQUEST_ALL`].
pub const CANCEL_ALL: &str = "cancel.all";

/// The broadcast subject for a query scope: `request.all` for the wildcard
/// scope, `request.scope.<scope>` otherwise.
pub fn request_subject(scope: &str) -> String {
    if scope == "*" {
        REQUEST_ALL.to_owned()
    } else {
        format!("request.scope.{scope}")
    }
}

/// The cancellation subject for a query scope.
pub fn cancel_subject(scope: &str) -> String {
    if scope == "*" {
        CANCEL_ALL.to_owned()
    } else {
        format!("cancel.scope.{scope}")
    }
}

/// The reply subject for one logical query: `query.<hyphenated-uuid>`.
pub fn query_reply(uuid: Uuid) -> String {
    format!("query.{uuid}")
}

/// Compile a subscription pattern to its matching regex.
pub fn subject_to_regex(pattern: &str) -> Result<Regex, BusError> {
    let invalid = |reason| BusError::InvalidSubject { subject: pattern.to_owned(), reason };
    if pattern.is_empty() {
        return Err(invalid("empty subject"));
    }

    let tokens: Vec<&str> = pattern.split('.').collect();
    let mut parts = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "" => return Err(invalid("empty token")),
            ">" => {
                if i != tokens.len() - 1 {
                    return Err(invalid("'>' is only valid as the final token"));
                }
                parts.push(".*".to_owned());
            }
            "*" => parts.push("[A-Za-z0-9_]+".to_owned()),
            literal => parts.push(regex::escape(literal)),
        }
    }

    let source = format!("^{}$", parts.join(r"\."));
    Regex::new(&source).map_err(|_| invalid("pattern did not compile"))
}

/// True when a published `subject` matches the subscription `pattern`.
/// Invalid patterns match nothing.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    match subject_to_regex(pattern) {
        Ok(re) => re.is_match(subject),
        Err(_) => false,
    }
}
