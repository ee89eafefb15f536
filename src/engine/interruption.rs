//! Interruptions: the decision surfaced to the HTTP adapter.

use serde::Serialize;

/// What the adapter must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disruption {
    /// Reply with `status`.
    Deny,
    /// Close the connection.
    Drop,
    /// Redirect to `data` with `status`.
    Redirect,
    /// Stop inspecting and let the request through.
    Allow,
    /// Forward the request to `data`.
    Proxy,
    /// Continue normally.
    Pass,
}

impl Disruption {
    /// Lowercase action name.
    pub fn name(&self) -> &'static str {
        match self {
            Disruption::Deny => "deny",
            Disruption::Drop => "drop",
            Disruption::Redirect => "redirect",
            Disruption::Allow => "allow",
            Disruption::Proxy => "proxy",
            Disruption::Pass => "pass",
        }
    }
}

impl std::fmt::Display for Disruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A request-level decision taken by a disruptive action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interruption {
    /// HTTP status to return (0 when the action has none).
    pub status: u16,
    /// Action to take.
    pub action: Disruption,
    /// Rule that interrupted; the chain starter for chains.
    pub rule_id: u64,
    /// Location for redirect, backend for proxy, empty otherwise.
    pub data: String,
}

impl Interruption {
    /// Interruption raised by the engine itself rather than a rule.
    pub fn engine(status: u16, action: Disruption) -> Self {
        Self {
            status,
            action,
            rule_id: 0,
            data: String::new(),
        }
    }

    /// Format as a log entry.
    pub fn format_log(&self) -> String {
        let mut out = format!("[action {}] [status {}] [rule_id {}]", self.action, self.status, self.rule_id);
        if !self.data.is_empty() {
            out.push_str(&format!(" [data \"{}\"]", self.data));
        }
        out
    }
}

/// How far an `allow` reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllowScope {
    /// Skip the rest of the current phase.
    Phase,
    /// Skip the remaining request phases (1 and 2).
    Request,
    /// Skip every remaining phase except logging.
    #[default]
    Transaction,
}

impl AllowScope {
    /// Whether rules of `phase` are skipped when the allow was issued in
    /// `issued`.
    pub fn covers(&self, issued: super::Phase, phase: super::Phase) -> bool {
        use super::Phase;
        match self {
            AllowScope::Phase => phase == issued,
            AllowScope::Request => phase.is_request_phase(),
            AllowScope::Transaction => phase != Phase::Logging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Phase;

    #[test]
    fn test_serializes_lowercase_action() {
        let i = Interruption {
            status: 403,
            action: Disruption::Deny,
            rule_id: 1,
            data: String::new(),
        };
        let json = serde_json::to_string(&i).unwrap();
        assert_eq!(json, r#"{"status":403,"action":"deny","rule_id":1,"data":""}"#);
    }

    #[test]
    fn test_format_log() {
        let i = Interruption {
            status: 302,
            action: Disruption::Redirect,
            rule_id: 7,
            data: "https://example.com/".to_string(),
        };
        assert_eq!(
            i.format_log(),
            "[action redirect] [status 302] [rule_id 7] [data \"https://example.com/\"]"
        );
    }

    #[test]
    fn test_allow_scope() {
        assert!(AllowScope::Phase.covers(Phase::RequestHeaders, Phase::RequestHeaders));
        assert!(!AllowScope::Phase.covers(Phase::RequestHeaders, Phase::RequestBody));
        assert!(AllowScope::Request.covers(Phase::RequestHeaders, Phase::RequestBody));
        assert!(!AllowScope::Request.covers(Phase::RequestHeaders, Phase::ResponseHeaders));
        assert!(AllowScope::Transaction.covers(Phase::RequestHeaders, Phase::ResponseBody));
        assert!(!AllowScope::Transaction.covers(Phase::RequestHeaders, Phase::Logging));
    }
}
