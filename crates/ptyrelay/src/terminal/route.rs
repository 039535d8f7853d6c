//! Terminal socket paths.
//!
//! `{base}/{context}/socket/{term|text|silent|process-status-updates}[/ro]`
//! where `{context}` may span several segments or be absent.

use crate::status::ResponseMode;

const SOCKET_SEGMENT: &str = "/socket/";

/// What a socket connection receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Output(ResponseMode),
    StatusUpdates,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRoute {
    pub context: String,
    pub endpoint: Endpoint,
    pub read_only: bool,
}

impl SocketRoute {
    /// Match `path` against the socket layout under `base_path`.
    pub fn parse(base_path: &str, path: &str) -> Option<Self> {
        let base = base_path.trim_end_matches('/');
        let rest = path.strip_prefix(base)?;
        if !rest.starts_with('/') {
            return None;
        }

        let idx = rest.rfind(SOCKET_SEGMENT)?;
        let context = rest[..idx].trim_matches('/').to_string();
        let suffix = &rest[idx + SOCKET_SEGMENT.len()..];

        let (kind, read_only) = match suffix.strip_suffix("/ro") {
            Some(kind) => (kind, true),
            None => (suffix, false),
        };
        let endpoint = match kind {
            "term" => Endpoint::Output(ResponseMode::Binary),
            "text" => Endpoint::Output(ResponseMode::Text),
            "silent" => Endpoint::Output(ResponseMode::Silent),
            "process-status-updates" => Endpoint::StatusUpdates,
            _ => return None,
        };

        Some(Self {
            context,
            endpoint,
            read_only,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_context_and_mode() {
        let route = SocketRoute::parse("/agent", "/agent/builds/42/socket/text").unwrap();
        assert_eq!(route.context, "builds/42");
        assert_eq!(route.endpoint, Endpoint::Output(ResponseMode::Text));
        assert!(!route.read_only);
    }

    #[test]
    fn empty_context_without_base() {
        let route = SocketRoute::parse("", "/socket/term/ro").unwrap();
        assert_eq!(route.context, "");
        assert_eq!(route.endpoint, Endpoint::Output(ResponseMode::Binary));
        assert!(route.read_only);
    }

    #[test]
    fn status_updates_endpoint() {
        let route = SocketRoute::parse("/", "/ctx/socket/process-status-updates").unwrap();
        assert_eq!(route.context, "ctx");
        assert_eq!(route.endpoint, Endpoint::StatusUpdates);
    }

    #[test]
    fn rejects_foreign_paths() {
        assert!(SocketRoute::parse("/agent", "/agentx/socket/term").is_none());
        assert!(SocketRoute::parse("/agent", "/agent/ctx/socket/unknown").is_none());
        assert!(SocketRoute::parse("/agent", "/agent/ctx/term").is_none());
        assert!(SocketRoute::parse("/agent", "/other/socket/term").is_none());
    }
}
