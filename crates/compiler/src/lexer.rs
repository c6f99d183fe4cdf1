//! Lexical analysis for Eel source text.
//!
//! The lexer is table driven: an ordered list of anchored regular
//! expressions is tried against the remaining input, and the first
//! pattern that matches produces the next token. Pattern order is
//! significant (keywords before `id`, two-character operators before
//! their one-character prefixes).

use crate::error::CompileError;
use regex::Regex;
use std::sync::OnceLock;

/// A 1-indexed (row, column) source position.
///
/// Rows advance on `\r\n`, `\r` or `\n` (a `\r\n` pair is a single
/// break); the column resets to 1 right after a break. Columns count
/// characters, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub row: usize,
    pub col: usize,
}

impl Position {
    pub fn start() -> Self {
        Position { row: 1, col: 1 }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.row, self.col)
    }
}

fn newline() -> &'static Regex {
    static NEWLINE: OnceLock<Regex> = OnceLock::new();
    NEWLINE.get_or_init(|| Regex::new(r"\r\n|\r|\n").expect("newline pattern"))
}

/// A cursor over the source text that tracks the current position.
pub struct Cursor<'a> {
    source: &'a str,
    offset: usize,
    pos: Position,
}

impl<'a> Cursor<'a> {
    pub fn new(source: &'a str) -> Self {
        Cursor {
            source,
            offset: 0,
            pos: Position::start(),
        }
    }

    /// The remaining unconsumed input.
    pub fn rest(&self) -> &'a str {
        &self.source[self.offset..]
    }

    pub fn position(&self) -> Position {
        self.pos
    }

    /// Advance by `nbytes` bytes, updating the tracked position.
    ///
    /// Advancing past the end of the source is a programmer error and
    /// panics.
    pub fn advance(&mut self, nbytes: usize) {
        let end = self.offset + nbytes;
        if end > self.source.len() {
            panic!("cursor advanced past the end of the source");
        }

        let crossed = &self.source[self.offset..end];
        let mut rows = 0;
        let mut last_break_end = None;
        for m in newline().find_iter(crossed) {
            rows += 1;
            last_break_end = Some(m.end());
        }

        if let Some(line_start) = last_break_end {
            self.pos.row += rows;
            self.pos.col = crossed[line_start..].chars().count() + 1;
        } else {
            self.pos.col += crossed.chars().count();
        }
        self.offset = end;
    }
}

/// The closed set of token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Keywords
    Program,
    Endprogram,
    Declare,
    Enddeclare,
    If,
    Then,
    Else,
    Endif,
    While,
    Endwhile,
    Repeat,
    Endrepeat,
    Exit,
    Switch,
    Case,
    Endswitch,
    Forcase,
    When,
    Endforcase,
    Procedure,
    Endprocedure,
    Function,
    Endfunction,
    Call,
    Return,
    In,
    Inout,
    And,
    Or,
    Not,
    True,
    False,
    Input,
    Print,
    // Punctuation
    Assign,
    Semicolon,
    Colon,
    Comma,
    // Names and literals
    Id,
    Int,
    // Operators
    Plus,
    Minus,
    Div,
    Mul,
    Oparen,
    Cparen,
    Obracket,
    Cbracket,
    Neq,
    Ge,
    Le,
    Gt,
    Lt,
    Eq,
}

impl TokenKind {
    /// The stable lowercase name used in diagnostics and, for
    /// keywords, the keyword text itself.
    pub fn name(&self) -> &'static str {
        match self {
            TokenKind::Program => "program",
            TokenKind::Endprogram => "endprogram",
            TokenKind::Declare => "declare",
            TokenKind::Enddeclare => "enddeclare",
            TokenKind::If => "if",
            TokenKind::Then => "then",
            TokenKind::Else => "else",
            TokenKind::Endif => "endif",
            TokenKind::While => "while",
            TokenKind::Endwhile => "endwhile",
            TokenKind::Repeat => "repeat",
            TokenKind::Endrepeat => "endrepeat",
            TokenKind::Exit => "exit",
            TokenKind::Switch => "switch",
            TokenKind::Case => "case",
            TokenKind::Endswitch => "endswitch",
            TokenKind::Forcase => "forcase",
            TokenKind::When => "when",
            TokenKind::Endforcase => "endforcase",
            TokenKind::Procedure => "procedure",
            TokenKind::Endprocedure => "endprocedure",
            TokenKind::Function => "function",
            TokenKind::Endfunction => "endfunction",
            TokenKind::Call => "call",
            TokenKind::Return => "return",
            TokenKind::In => "in",
            TokenKind::Inout => "inout",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Input => "input",
            TokenKind::Print => "print",
            TokenKind::Assign => "assign",
            TokenKind::Semicolon => "semicolon",
            TokenKind::Colon => "colon",
            TokenKind::Comma => "comma",
            TokenKind::Id => "id",
            TokenKind::Int => "int",
            TokenKind::Plus => "plus",
            TokenKind::Minus => "minus",
            TokenKind::Div => "div",
            TokenKind::Mul => "mul",
            TokenKind::Oparen => "oparen",
            TokenKind::Cparen => "cparen",
            TokenKind::Obracket => "obracket",
            TokenKind::Cbracket => "cbracket",
            TokenKind::Neq => "neq",
            TokenKind::Ge => "ge",
            TokenKind::Le => "le",
            TokenKind::Gt => "gt",
            TokenKind::Lt => "lt",
            TokenKind::Eq => "eq",
        }
    }
}

/// A token with its matched value and the position of its first
/// character. Identifiers keep only their first 30 characters as the
/// value (the full run is still consumed).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub pos: Position,
}

const KEYWORDS: &[TokenKind] = &[
    TokenKind::Program,
    TokenKind::Endprogram,
    TokenKind::Declare,
    TokenKind::Enddeclare,
    TokenKind::If,
    TokenKind::Then,
    TokenKind::Else,
    TokenKind::Endif,
    TokenKind::While,
    TokenKind::Endwhile,
    TokenKind::Repeat,
    TokenKind::Endrepeat,
    TokenKind::Exit,
    TokenKind::Switch,
    TokenKind::Case,
    TokenKind::Endswitch,
    TokenKind::Forcase,
    TokenKind::When,
    TokenKind::Endforcase,
    TokenKind::Procedure,
    TokenKind::Endprocedure,
    TokenKind::Function,
    TokenKind::Endfunction,
    TokenKind::Call,
    TokenKind::Return,
    TokenKind::In,
    TokenKind::Inout,
    TokenKind::And,
    TokenKind::Or,
    TokenKind::Not,
    TokenKind::True,
    TokenKind::False,
    TokenKind::Input,
    TokenKind::Print,
];

// Two-character operators must precede their one-character prefixes.
const SYMBOL_PATTERNS: &[(TokenKind, &str)] = &[
    (TokenKind::Assign, r"^:="),
    (TokenKind::Semicolon, r"^;"),
    (TokenKind::Colon, r"^:"),
    (TokenKind::Comma, r"^,"),
    (TokenKind::Id, r"^([a-zA-Z][a-zA-Z0-9]{0,29})[a-zA-Z0-9]*"),
    (TokenKind::Int, r"^\d+\b"),
    (TokenKind::Plus, r"^\+"),
    (TokenKind::Minus, r"^-"),
    (TokenKind::Div, r"^/"),
    (TokenKind::Mul, r"^\*"),
    (TokenKind::Oparen, r"^\("),
    (TokenKind::Cparen, r"^\)"),
    (TokenKind::Obracket, r"^\["),
    (TokenKind::Cbracket, r"^\]"),
    (TokenKind::Neq, r"^<>"),
    (TokenKind::Ge, r"^>="),
    (TokenKind::Le, r"^<="),
    (TokenKind::Gt, r"^>"),
    (TokenKind::Lt, r"^<"),
    (TokenKind::Eq, r"^="),
];

struct Patterns {
    /// A balanced block comment, shortest match.
    comment: Regex,
    /// Prefixes skipped without producing a token.
    ignored: Vec<Regex>,
    /// The ordered token patterns.
    valid: Vec<(TokenKind, Regex)>,
}

/// The process-wide pattern tables, compiled once on first use.
fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let comment = Regex::new(r"(?s)^/\*.*?\*/").expect("comment pattern");
        let ignored = vec![
            Regex::new(r"^\s+").expect("whitespace pattern"),
            comment.clone(),
            Regex::new(r"^//.*").expect("line comment pattern"),
        ];

        let mut valid = Vec::with_capacity(KEYWORDS.len() + SYMBOL_PATTERNS.len());
        for kind in KEYWORDS {
            let pattern = format!(r"^{}\b", kind.name());
            valid.push((*kind, Regex::new(&pattern).expect("keyword pattern")));
        }
        for (kind, pattern) in SYMBOL_PATTERNS {
            valid.push((*kind, Regex::new(pattern).expect("token pattern")));
        }

        Patterns {
            comment,
            ignored,
            valid,
        }
    })
}

fn int_in_range(text: &str) -> bool {
    text.parse::<i64>()
        .map(|v| (-32767..=32767).contains(&v))
        .unwrap_or(false)
}

/// The lexer proper: repeatedly matches the pattern tables against the
/// unconsumed input until it is exhausted.
pub struct Lexer<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            cursor: Cursor::new(source),
        }
    }

    /// Produce the full token list, or the first lexical error.
    ///
    /// At each step: reject invalid prefixes (a stray `*/`, or a `/*`
    /// that never closes), then skip ignored prefixes, then try the
    /// ordered token patterns. An `int` match whose value falls
    /// outside -32767..=32767 does not count as a match and the
    /// remaining patterns are tried.
    pub fn tokenize(mut self) -> Result<Vec<Token>, CompileError> {
        let patterns = patterns();
        let mut tokens = Vec::new();

        'scan: while !self.cursor.rest().is_empty() {
            let rest = self.cursor.rest();
            let pos = self.cursor.position();

            if rest.starts_with("*/") {
                return Err(CompileError::new(
                    pos,
                    "A comment was ended here but it never started.",
                ));
            }
            if rest.starts_with("/*") && !patterns.comment.is_match(rest) {
                return Err(CompileError::new(
                    pos,
                    "A comment starts here that never ends.",
                ));
            }

            for ignored in &patterns.ignored {
                if let Some(m) = ignored.find(rest) {
                    self.cursor.advance(m.end());
                    continue 'scan;
                }
            }

            for (kind, regex) in &patterns.valid {
                let Some(caps) = regex.captures(rest) else {
                    continue;
                };
                let Some(whole) = caps.get(0) else {
                    continue;
                };
                // Identifiers record only their significant prefix.
                let value = caps.get(1).map_or(whole.as_str(), |group| group.as_str());
                if *kind == TokenKind::Int && !int_in_range(value) {
                    continue;
                }
                tokens.push(Token {
                    kind: *kind,
                    value: value.to_string(),
                    pos,
                });
                self.cursor.advance(whole.end());
                continue 'scan;
            }

            let word = rest.split_whitespace().next().unwrap_or(rest);
            return Err(CompileError::new(pos, format!("Invalid token: {}", word)));
        }

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("program prog declare x enddeclare endprogram"),
            vec![
                TokenKind::Program,
                TokenKind::Id,
                TokenKind::Declare,
                TokenKind::Id,
                TokenKind::Enddeclare,
                TokenKind::Endprogram,
            ]
        );
    }

    #[test]
    fn test_keyword_prefix_is_an_identifier() {
        // `iffy` must not lex as the keyword `if`.
        let tokens = Lexer::new("iffy inoutward").tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Id);
        assert_eq!(tokens[0].value, "iffy");
        assert_eq!(tokens[1].kind, TokenKind::Id);
        assert_eq!(tokens[1].value, "inoutward");
    }

    #[test]
    fn test_two_char_operators_win_over_prefixes() {
        assert_eq!(
            kinds(":= : <> < <= >= > ="),
            vec![
                TokenKind::Assign,
                TokenKind::Colon,
                TokenKind::Neq,
                TokenKind::Lt,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Gt,
                TokenKind::Eq,
            ]
        );
    }

    #[test]
    fn test_identifier_truncates_to_thirty_chars() {
        let thirty = "a".repeat(30);
        let thirty_one = "a".repeat(31);
        let t30 = Lexer::new(&thirty).tokenize().unwrap();
        let t31 = Lexer::new(&thirty_one).tokenize().unwrap();
        assert_eq!(t30[0].value, thirty);
        assert_eq!(t31[0].value, thirty);
        assert_eq!(t30.len(), 1);
        assert_eq!(t31.len(), 1);
    }

    #[test]
    fn test_int_range_boundary() {
        let ok = Lexer::new("32767").tokenize().unwrap();
        assert_eq!(ok[0].kind, TokenKind::Int);
        assert_eq!(ok[0].value, "32767");

        let err = Lexer::new("32768").tokenize().unwrap_err();
        assert_eq!(err.message, "Invalid token: 32768");
    }

    #[test]
    fn test_positions_track_line_breaks() {
        let tokens = Lexer::new("if\r\nthen\rx\ny").tokenize().unwrap();
        assert_eq!(tokens[0].pos, Position { row: 1, col: 1 });
        assert_eq!(tokens[1].pos, Position { row: 2, col: 1 });
        assert_eq!(tokens[2].pos, Position { row: 3, col: 1 });
        assert_eq!(tokens[3].pos, Position { row: 4, col: 1 });
    }

    #[test]
    fn test_position_within_a_line() {
        let tokens = Lexer::new("x := 3").tokenize().unwrap();
        assert_eq!(tokens[0].pos, Position { row: 1, col: 1 });
        assert_eq!(tokens[1].pos, Position { row: 1, col: 3 });
        assert_eq!(tokens[2].pos, Position { row: 1, col: 6 });
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("x /* a\nblock * comment */ y // line\nz"),
            vec![TokenKind::Id, TokenKind::Id, TokenKind::Id]
        );
    }

    #[test]
    fn test_unclosed_comment_is_an_error() {
        let err = Lexer::new("x /* never closed").tokenize().unwrap_err();
        assert_eq!(err.message, "A comment starts here that never ends.");
        assert_eq!(err.pos, Position { row: 1, col: 3 });
    }

    #[test]
    fn test_stray_comment_close_is_an_error() {
        let err = Lexer::new("x */ y").tokenize().unwrap_err();
        assert_eq!(err.message, "A comment was ended here but it never started.");
        assert_eq!(err.pos, Position { row: 1, col: 3 });
    }

    #[test]
    fn test_invalid_token_names_the_offending_word() {
        let err = Lexer::new("x ?boom y").tokenize().unwrap_err();
        assert_eq!(err.message, "Invalid token: ?boom");
    }

    #[test]
    fn test_relex_of_canonical_form_is_stable() {
        let source = "program p declare x enddeclare x := 3 + 4 endprogram";
        let first = Lexer::new(source).tokenize().unwrap();
        let canonical = first
            .iter()
            .map(|t| t.value.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let second = Lexer::new(&canonical).tokenize().unwrap();
        let strip = |ts: &[Token]| {
            ts.iter()
                .map(|t| (t.kind, t.value.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&first), strip(&second));
    }
}
