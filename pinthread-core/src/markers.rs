//! Hidden markers embedded in remote issue and comment bodies.
//!
//! Trackers have no native notion of "this comment replies to that one" and
//! no place to store our scope, so both travel inside HTML comments that
//! markdown renderers hide:
//!
//! - `<!-- pinthread:reply-to=<remote id> -->` at the end of a reply body;
//! - `<!-- pinthread:meta {json} -->` inside the issue body, carrying route,
//!   version, anchor and the originating local thread id.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{Anchor, RemoteId, Scope, ThreadId};

/// Label attached to every issue the engine creates.
pub const ISSUE_LABEL: &str = "pinthread";

static REPLY_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*pinthread:reply-to=([^\s>]+)\s*-->").expect("reply marker regex")
});

static META_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--\s*pinthread:meta\s+(\{.*?\})\s*-->").expect("meta marker regex")
});

/// Appends a reply marker for `parent` to `text`. Root comments are returned
/// unchanged.
pub fn encode_reply(text: &str, parent: Option<&RemoteId>) -> String {
    match parent {
        Some(parent) => format!("{}\n\n<!-- pinthread:reply-to={} -->", text.trim_end(), parent),
        None => text.to_owned(),
    }
}

/// Splits a remote comment body into display text and the parent remote id
/// carried by its reply marker, if any.
///
/// Every marker is stripped from the returned text; when several are present
/// the first one wins.
pub fn parse_reply(body: &str) -> (String, Option<RemoteId>) {
    let parent = REPLY_MARKER
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| RemoteId::new(m.as_str()));
    (strip_reply_markers(body), parent)
}

pub fn strip_reply_markers(body: &str) -> String {
    if !REPLY_MARKER.is_match(body) {
        return body.to_owned();
    }
    REPLY_MARKER.replace_all(body, "").trim_end().to_owned()
}

/// Scope metadata stored in the body of every remote issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueMeta {
    pub route: String,
    pub version: String,
    pub anchor: Anchor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadId>,
}

impl IssueMeta {
    pub fn scope(&self) -> Scope {
        Scope::new(self.route.clone(), self.version.clone())
    }

    pub fn matches(&self, scope: &Scope) -> bool {
        self.route == scope.route && self.version == scope.version
    }
}

pub fn issue_title(scope: &Scope, anchor: &Anchor) -> String {
    format!("Feedback on {} [{}]", scope.route, anchor.label())
}

/// Renders the issue body: a short human-readable summary followed by the
/// hidden metadata block.
pub fn encode_issue_body(meta: &IssueMeta) -> String {
    // `>` only ever appears inside JSON strings, so escaping it keeps the
    // payload valid while making an early `-->` impossible.
    let json = serde_json::to_string(meta)
        .unwrap_or_else(|_| "{}".to_owned())
        .replace('>', "\\u003e");
    format!(
        "Feedback pinned on `{}` (version `{}`) at {}.\n\n<!-- pinthread:meta {} -->",
        meta.route,
        meta.version,
        meta.anchor.label(),
        json
    )
}

/// Recovers the metadata block from an issue body. Bodies without a block, or
/// with a block that does not parse, yield `None`.
pub fn parse_issue_meta(body: &str) -> Option<IssueMeta> {
    let caps = META_MARKER.captures(body)?;
    serde_json::from_str(caps.get(1)?.as_str()).ok()
}
