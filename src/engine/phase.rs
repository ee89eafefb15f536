//! Transaction phases.

/// Points of the HTTP exchange at which rules run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Phase {
    /// 1: request line and headers.
    #[default]
    RequestHeaders,
    /// 2: request body.
    RequestBody,
    /// 3: response status and headers.
    ResponseHeaders,
    /// 4: response body.
    ResponseBody,
    /// 5: after the exchange, always runs.
    Logging,
}

impl Phase {
    /// Every phase in evaluation order.
    pub const ALL: [Phase; 5] = [
        Phase::RequestHeaders,
        Phase::RequestBody,
        Phase::ResponseHeaders,
        Phase::ResponseBody,
        Phase::Logging,
    ];

    /// SecLang phase number, 1 to 5.
    pub fn number(&self) -> u8 {
        self.index() as u8 + 1
    }

    /// Position in [`Phase::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Phase::RequestHeaders => 0,
            Phase::RequestBody => 1,
            Phase::ResponseHeaders => 2,
            Phase::ResponseBody => 3,
            Phase::Logging => 4,
        }
    }

    /// Upper-case name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::RequestHeaders => "REQUEST_HEADERS",
            Phase::RequestBody => "REQUEST_BODY",
            Phase::ResponseHeaders => "RESPONSE_HEADERS",
            Phase::ResponseBody => "RESPONSE_BODY",
            Phase::Logging => "LOGGING",
        }
    }

    /// Argument of the `phase` action: `1`..`5` or one of the aliases
    /// `request` (2), `response` (4) and `logging` (5).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("request") {
            return Some(Phase::RequestBody);
        }
        if s.eq_ignore_ascii_case("response") {
            return Some(Phase::ResponseBody);
        }
        if s.eq_ignore_ascii_case("logging") {
            return Some(Phase::Logging);
        }
        let n: usize = s.parse().ok()?;
        Phase::ALL.get(n.checked_sub(1)?).copied()
    }

    /// Phases 1 and 2.
    pub fn is_request_phase(&self) -> bool {
        *self <= Phase::RequestBody
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}
