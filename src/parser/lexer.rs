//! Tokenizer for SecLang configuration text.
//!
//! SecLang is line oriented: a directive name opens a logical line, a
//! trailing backslash joins physical lines, and arguments are bare words,
//! single or double quoted strings, or backtick blocks.

/// A token and where it starts.
#[derive(Debug, Clone)]
pub struct Token {
    /// What was read.
    pub kind: TokenKind,
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub column: usize,
}

/// Token kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// First word of a logical line when it names a directive.
    Directive(String),
    /// Bare word.
    Word(String),
    /// Quoted string or backtick block, delimiters removed.
    Quoted(String),
    /// `#` comment up to the end of the line.
    Comment,
    /// End of a logical line.
    Newline,
}

/// Whether `word` can open a directive line.
fn is_directive_name(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    lower.starts_with("sec") || lower == "include"
}

/// Streaming tokenizer over one configuration text.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    column: usize,
    line_start: bool,
}

impl<'a> Lexer<'a> {
    /// Tokenize `src`.
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            column: 1,
            line_start: true,
        }
    }

    /// Next character, not consumed.
    pub fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.src[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
            self.line_start = true;
        } else {
            self.column += 1;
            if !c.is_whitespace() {
                self.line_start = false;
            }
        }
        Some(c)
    }

    /// Skip blanks on the current line.
    pub fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\r')) {
            self.bump();
        }
    }

    fn at_continuation(&self) -> bool {
        self.peek() == Some('\\') && matches!(self.peek_second(), Some('\n') | Some('\r'))
    }

    fn skip_continuation(&mut self) {
        self.bump();
        if self.peek() == Some('\r') {
            self.bump();
        }
        if self.peek() == Some('\n') {
            self.bump();
        }
        self.line_start = false;
    }

    /// Read the next token, `None` at end of input.
    pub fn next_token(&mut self) -> Option<Token> {
        loop {
            self.skip_whitespace();
            if !self.at_continuation() {
                break;
            }
            self.skip_continuation();
        }

        let (line, column) = (self.line, self.column);
        let token = |kind| Some(Token { kind, line, column });

        match self.peek()? {
            '\n' => {
                self.bump();
                token(TokenKind::Newline)
            }
            '#' => {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
                token(TokenKind::Comment)
            }
            q @ ('"' | '\'') => {
                self.bump();
                let text = self.quoted(q);
                token(TokenKind::Quoted(text))
            }
            '`' => {
                self.bump();
                let text = self.block();
                token(TokenKind::Quoted(text))
            }
            _ => {
                let opens_line = self.line_start;
                let word = self.word();
                if word.is_empty() {
                    self.bump();
                    return self.next_token();
                }
                if opens_line && is_directive_name(&word) {
                    token(TokenKind::Directive(word))
                } else {
                    token(TokenKind::Word(word))
                }
            }
        }
    }

    /// Body of a quoted string. `\<quote>` yields the quote, `\\` is kept
    /// doubled for the operator, and a backslash before a newline joins
    /// the lines. Any other backslash is kept as is.
    fn quoted(&mut self, q: char) -> String {
        let mut out = String::new();
        while let Some(c) = self.bump() {
            if c == q {
                break;
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            match self.peek() {
                Some(n) if n == q => {
                    self.bump();
                    out.push(n);
                }
                Some('\\') => {
                    self.bump();
                    out.push_str("\\\\");
                }
                Some('\n') | Some('\r') => {
                    if self.peek() == Some('\r') {
                        self.bump();
                    }
                    if self.peek() == Some('\n') {
                        self.bump();
                    }
                }
                _ => out.push('\\'),
            }
        }
        out
    }

    fn block(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '`' {
                let text = self.src[start..self.pos].to_string();
                self.bump();
                return text;
            }
            self.bump();
        }
        self.src[start..].to_string()
    }

    fn word(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if self.at_continuation() {
                self.skip_continuation();
                continue;
            }
            if c.is_whitespace() || matches!(c, '"' | '\'' | '`') {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src);
        std::iter::from_fn(|| lexer.next_token()).map(|t| t.kind).collect()
    }

    fn word(s: &str) -> TokenKind {
        TokenKind::Word(s.to_string())
    }

    fn quoted(s: &str) -> TokenKind {
        TokenKind::Quoted(s.to_string())
    }

    fn directive(s: &str) -> TokenKind {
        TokenKind::Directive(s.to_string())
    }

    #[test]
    fn test_rule_tokens() {
        assert_eq!(
            kinds(r#"SecRule REQUEST_URI "@contains /admin" "id:1,deny""#),
            vec![
                directive("SecRule"),
                word("REQUEST_URI"),
                quoted("@contains /admin"),
                quoted("id:1,deny"),
            ]
        );
    }

    #[test]
    fn test_directive_only_at_line_start() {
        assert_eq!(
            kinds("SecMarker SecEnd\nInclude x.conf"),
            vec![
                directive("SecMarker"),
                word("SecEnd"),
                TokenKind::Newline,
                directive("Include"),
                word("x.conf"),
            ]
        );
    }

    #[test]
    fn test_comment_then_directive() {
        assert_eq!(
            kinds("# note\nSecRuleEngine On"),
            vec![TokenKind::Comment, TokenKind::Newline, directive("SecRuleEngine"), word("On")]
        );
    }

    #[test]
    fn test_escaped_quote() {
        assert_eq!(kinds(r#""say \"hi\"""#), vec![quoted(r#"say "hi""#)]);
        assert_eq!(kinds(r"'it\'s'"), vec![quoted("it's")]);
    }

    #[test]
    fn test_regex_escapes_survive() {
        assert_eq!(kinds(r#""@rx ^\d+\\x\.""#), vec![quoted(r"@rx ^\d+\\x\.")]);
    }

    #[test]
    fn test_continuations() {
        assert_eq!(kinds("Sec\\\nRule"), vec![directive("SecRule")]);
        assert_eq!(
            kinds("SecRule \\\n  ARGS \\\r\n  \"x\""),
            vec![directive("SecRule"), word("ARGS"), quoted("x")]
        );
        assert_eq!(kinds("\"id:1,\\\n    deny\""), vec![quoted("id:1,    deny")]);
    }

    #[test]
    fn test_backtick_block() {
        assert_eq!(
            kinds("SecDataset ips `\n10.0.0.1\n10.0.0.2\n`"),
            vec![directive("SecDataset"), word("ips"), quoted("\n10.0.0.1\n10.0.0.2\n")]
        );
    }

    #[test]
    fn test_positions() {
        let mut lexer = Lexer::new("SecAction \\\n  \"id:1\"\n  SecMarker END");
        let first = lexer.next_token().unwrap();
        assert_eq!((first.line, first.column), (1, 1));
        let second = lexer.next_token().unwrap();
        assert_eq!((second.line, second.column), (2, 3));
        lexer.next_token();
        let marker = lexer.next_token().unwrap();
        assert_eq!(marker.kind, directive("SecMarker"));
        assert_eq!((marker.line, marker.column), (3, 3));
    }
}
