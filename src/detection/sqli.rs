//! SQL injection detection.
//!
//! The input is tokenized as SQL three times: as-is, and as if it were the
//! tail of a single- or double-quoted string literal (the usual injection
//! point). Each token maps to a one-character code and the token stream is
//! checked for shapes that break out of a literal: a closed quote followed
//! by a logic operator or a comment, a stacked statement, `UNION SELECT`,
//! time-based functions, and numeric tautologies.
//!
//! The fingerprint returned on detection is the code of the first five
//! tokens, e.g. `s&sos` for `1' OR '1'='1`.

use phf::phf_set;

const MAX_TOKENS: usize = 32;
const FINGERPRINT_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    String,
    Number,
    Keyword,
    Union,
    Function,
    Operator,
    Logic,
    Comment,
    Semicolon,
    Open,
    Close,
    Comma,
    Variable,
    Bareword,
}

impl Kind {
    fn code(self) -> char {
        match self {
            Kind::String => 's',
            Kind::Number => '1',
            Kind::Keyword => 'k',
            Kind::Union => 'U',
            Kind::Function => 'f',
            Kind::Operator => 'o',
            Kind::Logic => '&',
            Kind::Comment => 'c',
            Kind::Semicolon => ';',
            Kind::Open => '(',
            Kind::Close => ')',
            Kind::Comma => ',',
            Kind::Variable => 'v',
            Kind::Bareword => 'n',
        }
    }

    fn is_operand(self) -> bool {
        matches!(
            self,
            Kind::String | Kind::Number | Kind::Bareword | Kind::Variable | Kind::Function | Kind::Open
        )
    }
}

#[derive(Debug, Clone)]
struct Token<'a> {
    kind: Kind,
    text: &'a str,
    /// For strings: whether the closing quote was seen.
    closed: bool,
}

static KEYWORDS: phf::Set<&'static str> = phf_set! {
    "SELECT", "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER",
    "CREATE", "REPLACE", "FROM", "WHERE", "INTO", "VALUES", "SET", "TABLE",
    "DATABASE", "EXEC", "EXECUTE", "HAVING", "GROUP", "ORDER", "BY", "LIMIT",
    "OFFSET", "JOIN", "CASE", "WHEN", "THEN", "ELSE", "END", "DECLARE",
    "WAITFOR", "DELAY", "SHUTDOWN", "NULL", "ALL", "DISTINCT", "EXISTS",
    "CALL", "PROCEDURE", "OUTFILE", "DUMPFILE", "GRANT", "REVOKE", "TRUE",
    "FALSE", "AS", "ON", "LOAD", "HANDLER", "RENAME",
};

static OPERATOR_WORDS: phf::Set<&'static str> = phf_set! {
    "LIKE", "RLIKE", "REGEXP", "DIV", "MOD", "NOT", "IS", "IN", "BETWEEN",
    "SOUNDS", "COLLATE", "ESCAPE",
};

static LOGIC_WORDS: phf::Set<&'static str> = phf_set! { "AND", "OR", "XOR" };

static UNION_WORDS: phf::Set<&'static str> = phf_set! { "UNION", "INTERSECT", "EXCEPT" };

/// Keywords that start a new statement after `;`.
static STATEMENTS: phf::Set<&'static str> = phf_set! {
    "SELECT", "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER",
    "CREATE", "REPLACE", "EXEC", "EXECUTE", "SHUTDOWN", "DECLARE", "WAITFOR",
    "CALL", "GRANT", "REVOKE", "LOAD", "HANDLER", "RENAME",
};

static DANGEROUS_FUNCTIONS: phf::Set<&'static str> = phf_set! {
    "SLEEP", "BENCHMARK", "PG_SLEEP", "LOAD_FILE", "EXTRACTVALUE",
    "UPDATEXML", "XP_CMDSHELL", "DBMS_PIPE.RECEIVE_MESSAGE", "GTID_SUBSET",
};

struct Tokenizer<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'.' || b >= 0x80
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn token(&self, kind: Kind, start: usize, end: usize) -> Token<'a> {
        Token {
            kind,
            text: &self.input[start..end],
            closed: false,
        }
    }

    /// Read a string body starting at `self.pos`, delimited by `quote`.
    fn string(&mut self, quote: u8) -> Token<'a> {
        let start = self.pos;
        while let Some(b) = self.peek(0) {
            if b == b'\\' {
                self.pos = (self.pos + 2).min(self.bytes.len());
                continue;
            }
            if b == quote {
                if self.peek(1) == Some(quote) {
                    self.pos += 2;
                    continue;
                }
                let token = Token {
                    kind: Kind::String,
                    text: &self.input[start..self.pos],
                    closed: true,
                };
                self.pos += 1;
                return token;
            }
            self.pos += 1;
        }
        self.token(Kind::String, start, self.pos)
    }

    fn skip_until(&mut self, needle: &[u8]) {
        match memchr::memmem::find(&self.bytes[self.pos..], needle) {
            Some(i) => self.pos += i + needle.len(),
            None => self.pos = self.bytes.len(),
        }
    }

    fn word(&mut self) -> Token<'a> {
        let start = self.pos;
        while self.peek(0).map_or(false, is_word_byte) {
            self.pos += 1;
        }
        let text = &self.input[start..self.pos];
        let upper = text.to_ascii_uppercase();
        let kind = if LOGIC_WORDS.contains(upper.as_str()) {
            Kind::Logic
        } else if UNION_WORDS.contains(upper.as_str()) {
            Kind::Union
        } else if OPERATOR_WORDS.contains(upper.as_str()) {
            Kind::Operator
        } else if KEYWORDS.contains(upper.as_str()) {
            Kind::Keyword
        } else if self.bytes[self.pos..]
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            == Some(&b'(')
        {
            Kind::Function
        } else {
            Kind::Bareword
        };
        self.token(kind, start, self.pos)
    }

    fn next_token(&mut self) -> Option<Token<'a>> {
        loop {
            let b = self.peek(0)?;
            let start = self.pos;
            match b {
                b if b.is_ascii_whitespace() => self.pos += 1,
                b'\'' | b'"' => {
                    self.pos += 1;
                    return Some(self.string(b));
                }
                b'`' => {
                    self.pos += 1;
                    self.skip_until(b"`");
                    return Some(self.token(Kind::Bareword, start, self.pos));
                }
                b'-' if self.peek(1) == Some(b'-') => {
                    self.skip_until(b"\n");
                    return Some(self.token(Kind::Comment, start, self.pos));
                }
                b'#' => {
                    self.skip_until(b"\n");
                    return Some(self.token(Kind::Comment, start, self.pos));
                }
                b'/' if self.peek(1) == Some(b'*') => {
                    self.pos += 2;
                    self.skip_until(b"*/");
                    return Some(self.token(Kind::Comment, start, self.pos));
                }
                b'0'..=b'9' => {
                    while self
                        .peek(0)
                        .map_or(false, |c| c.is_ascii_alphanumeric() || c == b'.')
                    {
                        self.pos += 1;
                    }
                    return Some(self.token(Kind::Number, start, self.pos));
                }
                b'.' if self.peek(1).map_or(false, |c| c.is_ascii_digit()) => {
                    self.pos += 1;
                    while self.peek(0).map_or(false, |c| c.is_ascii_digit()) {
                        self.pos += 1;
                    }
                    return Some(self.token(Kind::Number, start, self.pos));
                }
                b'@' => {
                    while self.peek(0) == Some(b'@') {
                        self.pos += 1;
                    }
                    while self.peek(0).map_or(false, is_word_byte) {
                        self.pos += 1;
                    }
                    return Some(self.token(Kind::Variable, start, self.pos));
                }
                b'(' | b')' | b',' | b';' => {
                    self.pos += 1;
                    let kind = match b {
                        b'(' => Kind::Open,
                        b')' => Kind::Close,
                        b',' => Kind::Comma,
                        _ => Kind::Semicolon,
                    };
                    return Some(self.token(kind, start, self.pos));
                }
                b'=' | b'<' | b'>' | b'!' | b'+' | b'-' | b'*' | b'/' | b'%' | b'&' | b'|'
                | b'^' | b'~' | b':' => {
                    let pair = [b, self.peek(1).unwrap_or(0)];
                    let kind = match &pair {
                        b"||" | b"&&" => Kind::Logic,
                        _ => Kind::Operator,
                    };
                    let width = match &pair {
                        b"<=" | b">=" | b"<>" | b"!=" | b"||" | b"&&" | b":=" | b"<<" | b">>" => 2,
                        _ => 1,
                    };
                    self.pos += width;
                    return Some(self.token(kind, start, self.pos));
                }
                b if b.is_ascii_alphabetic() || b == b'_' || b == b'$' || b >= 0x80 => {
                    return Some(self.word());
                }
                _ => self.pos += 1,
            }
        }
    }
}

fn tokenize(input: &str, quote: Option<u8>) -> Vec<Token<'_>> {
    let mut tokenizer = Tokenizer::new(input);
    let mut tokens = Vec::new();
    if let Some(q) = quote {
        tokens.push(tokenizer.string(q));
    }
    while tokens.len() < MAX_TOKENS {
        match tokenizer.next_token() {
            Some(t) => tokens.push(t),
            None => break,
        }
    }
    tokens
}

fn upper_in(token: &Token<'_>, set: &phf::Set<&'static str>) -> bool {
    set.contains(token.text.to_ascii_uppercase().as_str())
}

fn kind_at(tokens: &[Token<'_>], i: usize) -> Option<Kind> {
    tokens.get(i).map(|t| t.kind)
}

/// `UNION [ALL|DISTINCT] SELECT`
fn union_select(tokens: &[Token<'_>]) -> bool {
    tokens.iter().enumerate().any(|(i, t)| {
        if t.kind != Kind::Union {
            return false;
        }
        let mut j = i + 1;
        if let Some(next) = tokens.get(j) {
            let upper = next.text.to_ascii_uppercase();
            if upper == "ALL" || upper == "DISTINCT" {
                j += 1;
            }
        }
        matches!(tokens.get(j), Some(n) if n.text.eq_ignore_ascii_case("select") || n.kind == Kind::Open)
    })
}

/// `...; DROP ...`
fn stacked_statement(tokens: &[Token<'_>]) -> bool {
    tokens.windows(2).any(|w| {
        w[0].kind == Kind::Semicolon && w[1].kind == Kind::Keyword && upper_in(&w[1], &STATEMENTS)
    })
}

fn dangerous_function(tokens: &[Token<'_>]) -> bool {
    tokens
        .iter()
        .any(|t| t.kind == Kind::Function && upper_in(t, &DANGEROUS_FUNCTIONS))
}

/// A literal closed right away and followed by SQL.
fn breakout(tokens: &[Token<'_>]) -> bool {
    let Some(first) = tokens.first() else {
        return false;
    };
    if first.kind != Kind::String || !first.closed {
        return false;
    }
    after_literal(tokens, 1)
}

/// A leading number followed by SQL.
fn numeric_prefix(tokens: &[Token<'_>]) -> bool {
    kind_at(tokens, 0) == Some(Kind::Number) && after_literal(tokens, 1)
}

fn after_literal(tokens: &[Token<'_>], at: usize) -> bool {
    let Some(next) = tokens.get(at) else {
        return false;
    };
    match next.kind {
        Kind::Comment => true,
        Kind::Union => true,
        Kind::Keyword => upper_in(next, &STATEMENTS),
        Kind::Logic => {
            let operand = kind_at(tokens, at + 1).map_or(false, Kind::is_operand);
            // `1 OR 2` is prose; `1 OR 1=1` is not.
            operand && (tokens[0].kind == Kind::String || kind_at(tokens, at + 2) == Some(Kind::Operator))
        }
        Kind::Operator => {
            tokens[0].kind == Kind::String && kind_at(tokens, at + 1).map_or(false, Kind::is_operand)
        }
        Kind::Close => matches!(
            kind_at(tokens, at + 1),
            Some(Kind::Logic | Kind::Union | Kind::Semicolon | Kind::Comment)
        ),
        _ => false,
    }
}

fn fingerprint(tokens: &[Token<'_>]) -> String {
    tokens.iter().take(FINGERPRINT_LEN).map(|t| t.kind.code()).collect()
}

fn check(tokens: &[Token<'_>]) -> bool {
    union_select(tokens)
        || stacked_statement(tokens)
        || dangerous_function(tokens)
        || breakout(tokens)
        || numeric_prefix(tokens)
}

/// Detect SQL injection; returns the fingerprint of the offending token
/// stream.
pub fn detect_sqli(input: &str) -> Option<String> {
    if input.is_empty() {
        return None;
    }
    let contexts: [Option<u8>; 3] = [None, Some(b'\''), Some(b'"')];
    for quote in contexts {
        if let Some(q) = quote {
            if memchr::memchr(q, input.as_bytes()).is_none() {
                continue;
            }
        }
        let tokens = tokenize(input, quote);
        if check(&tokens) {
            return Some(fingerprint(&tokens));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_sqli(s: &str) -> bool {
        detect_sqli(s).is_some()
    }

    #[test]
    fn test_classic_injection() {
        assert!(is_sqli("1' OR '1'='1"));
        assert!(is_sqli("' OR 1=1--"));
        assert!(is_sqli("admin'--"));
        assert!(is_sqli("1 OR 1=1"));
        assert!(is_sqli("x\" or \"x\"=\"x"));
    }

    #[test]
    fn test_union_injection() {
        assert!(is_sqli("1 UNION SELECT * FROM users"));
        assert!(is_sqli("' UNION SELECT username, password FROM users--"));
        assert!(is_sqli("1' UNION ALL SELECT NULL,NULL,NULL--"));
    }

    #[test]
    fn test_comment_injection() {
        assert!(is_sqli("admin'/*"));
        assert!(is_sqli("1--"));
        assert!(is_sqli("'/* comment */"));
    }

    #[test]
    fn test_stacked_queries() {
        assert!(is_sqli("1; DROP TABLE users"));
        assert!(is_sqli("'; DELETE FROM users--"));
    }

    #[test]
    fn test_time_based() {
        assert!(is_sqli("1 and sleep(5)"));
        assert!(is_sqli("benchmark (1000000, md5(1))"));
    }

    #[test]
    fn test_safe_input() {
        assert!(!is_sqli(""));
        assert!(!is_sqli("hello world"));
        assert!(!is_sqli("normal search query"));
        assert!(!is_sqli("user@example.com"));
        assert!(!is_sqli("John O'Brien"));
        assert!(!is_sqli("1 or 2 items"));
        assert!(!is_sqli("rock and roll"));
    }

    #[test]
    fn test_fingerprint() {
        assert_eq!(detect_sqli("1' OR '1'='1").as_deref(), Some("s&sos"));
        assert_eq!(detect_sqli("1 UNION SELECT 1").as_deref(), Some("1Uk1"));
    }

    #[test]
    fn test_tokenizer_shapes() {
        let codes = |s: &str, q| tokenize(s, q).iter().map(|t| t.kind.code()).collect::<String>();
        assert_eq!(codes("a = 'b' -- x", None), "nosc");
        assert_eq!(codes("count(*), @@version", None), "f(o),v");
        assert_eq!(codes("x' and 1", Some(b'\'')), "s&1");
        assert_eq!(codes("1 || 2", None), "1&1");
    }
}
