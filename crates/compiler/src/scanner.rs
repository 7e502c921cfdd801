//! Regex-driven tokenizer for Haze source text.
//!
//! One master alternation of named patterns drives the whole scanner.
//! Pattern order is load-bearing: two-character operators come before
//! their one-character prefixes, keywords (word-bounded) come before the
//! general identifier pattern, and the `%define` / `%include` directives
//! and register names come before the bare `%` modulo operator.

use crate::error::{CompileError, SourceLocation};
use regex::Regex;
use std::sync::OnceLock;

/// Token kinds produced by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Number,
    String,
    Identifier,
    Char,

    OpenParen,
    CloseParen,
    OpenSquare,
    CloseSquare,
    OpenBrace,
    CloseBrace,

    Semicolon,
    Colon,
    QuestionMark,
    Dot,
    Comma,

    Plus,
    Minus,
    Star,
    Bang,
    Slash,
    Pipe,
    Equals,
    Percent,
    Caret,
    Ampersand,
    Arrow,

    Varargs,

    And,
    Or,
    EqEq,
    NotEq,
    Greater,
    GreaterEq,
    Less,
    LessEq,

    If,
    Else,
    While,
    Break,
    External,
    Return,
    Local,
    True,
    False,
    New,
    Var,
    Stdcall,
    Res,
    Sizeof,
    Switch,
    Case,
    Default,
    Push,
    Pop,
    Call,
    Asm,

    Proc,
    Ptr,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    Struct,
    Enum,
    Class,

    Define,
    Include,

    Register,

    Eof,
}

/// A single lexeme with its kind and source position. Literal lexemes
/// keep their original source form (quotes included); escape resolution
/// happens in later passes.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub location: SourceLocation,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, location: SourceLocation) -> Self {
        Token {
            kind,
            lexeme: lexeme.into(),
            location,
        }
    }
}

/// What a master-pattern branch produces.
#[derive(Debug, Clone, Copy)]
enum Rule {
    Newline,
    LineComment,
    Token(TokenKind),
}

/// Branches of the master pattern, in match-priority order.
const PATTERNS: &[(Rule, &str)] = &[
    (Rule::Newline, r"\n"),
    (Rule::LineComment, r"//.*"),
    (Rule::Token(TokenKind::Number), r"\d+"),
    (Rule::Token(TokenKind::Star), r"\*"),
    (Rule::Token(TokenKind::Plus), r"\+"),
    (Rule::Token(TokenKind::Arrow), r"->"),
    (Rule::Token(TokenKind::Minus), r"-"),
    (Rule::Token(TokenKind::Slash), r"/"),
    (Rule::Token(TokenKind::OpenParen), r"\("),
    (Rule::Token(TokenKind::CloseParen), r"\)"),
    (Rule::Token(TokenKind::OpenSquare), r"\["),
    (Rule::Token(TokenKind::CloseSquare), r"\]"),
    (Rule::Token(TokenKind::OpenBrace), r"\{"),
    (Rule::Token(TokenKind::CloseBrace), r"\}"),
    (Rule::Token(TokenKind::Comma), r","),
    (Rule::Token(TokenKind::Varargs), r"\.\.\."),
    (Rule::Token(TokenKind::Dot), r"\."),
    (Rule::Token(TokenKind::Semicolon), r";"),
    (Rule::Token(TokenKind::Colon), r":"),
    (Rule::Token(TokenKind::Or), r"\|\||\bor\b"),
    (Rule::Token(TokenKind::And), r"&&|\band\b"),
    (Rule::Token(TokenKind::Caret), r"\^"),
    (Rule::Token(TokenKind::Pipe), r"\|"),
    (Rule::Token(TokenKind::Ampersand), r"&"),
    (Rule::Token(TokenKind::NotEq), r"!="),
    (Rule::Token(TokenKind::Bang), r"!"),
    (Rule::Token(TokenKind::QuestionMark), r"\?"),
    (Rule::Token(TokenKind::EqEq), r"=="),
    (Rule::Token(TokenKind::Equals), r"="),
    (Rule::Token(TokenKind::GreaterEq), r">="),
    (Rule::Token(TokenKind::Greater), r">"),
    (Rule::Token(TokenKind::LessEq), r"<="),
    (Rule::Token(TokenKind::Less), r"<"),
    (Rule::Token(TokenKind::U8), r"\bu8\b"),
    (Rule::Token(TokenKind::U16), r"\bu16\b"),
    (Rule::Token(TokenKind::U32), r"\bu32\b"),
    (Rule::Token(TokenKind::U64), r"\bu64\b"),
    (Rule::Token(TokenKind::I8), r"\bi8\b"),
    (Rule::Token(TokenKind::I16), r"\bi16\b"),
    (Rule::Token(TokenKind::I32), r"\bi32\b"),
    (Rule::Token(TokenKind::I64), r"\bi64\b"),
    (Rule::Token(TokenKind::Ptr), r"\bptr\b"),
    (Rule::Token(TokenKind::Proc), r"\bproc\b"),
    (Rule::Token(TokenKind::Struct), r"\bstruct\b"),
    (Rule::Token(TokenKind::Class), r"\bclass\b"),
    (Rule::Token(TokenKind::Enum), r"\benum\b"),
    (Rule::Token(TokenKind::Local), r"\blocal\b"),
    (Rule::Token(TokenKind::Break), r"\bbreak\b"),
    (Rule::Token(TokenKind::External), r"\bexternal\b"),
    (Rule::Token(TokenKind::Return), r"\breturn\b"),
    (Rule::Token(TokenKind::New), r"\bnew\b"),
    (Rule::Token(TokenKind::True), r"\btrue\b"),
    (Rule::Token(TokenKind::False), r"\bfalse\b"),
    (Rule::Token(TokenKind::While), r"\bwhile\b"),
    (Rule::Token(TokenKind::If), r"\bif\b"),
    (Rule::Token(TokenKind::Else), r"\belse\b"),
    (Rule::Token(TokenKind::Var), r"\bvar\b"),
    (Rule::Token(TokenKind::Stdcall), r"\bstdcall\b"),
    (Rule::Token(TokenKind::Res), r"\bres\b"),
    (Rule::Token(TokenKind::Switch), r"\bswitch\b"),
    (Rule::Token(TokenKind::Case), r"\bcase\b"),
    (Rule::Token(TokenKind::Default), r"\bdefault\b"),
    (Rule::Token(TokenKind::Push), r"\bpush\b"),
    (Rule::Token(TokenKind::Pop), r"\bpop\b|\bdrop\b"),
    (Rule::Token(TokenKind::Call), r"\bcall\b"),
    (Rule::Token(TokenKind::Asm), r"\basm\b"),
    (
        Rule::Token(TokenKind::Register),
        r"%rsp\b|%rbp\b|%rax\b|%rbx\b|%rcx\b|%rdx\b|%rdi\b|%rsi\b|%r8\b|%r9\b|%r10\b|%r11\b|%r12\b|%r13\b|%r14\b|%r15\b",
    ),
    (Rule::Token(TokenKind::Define), r"%define\b"),
    (Rule::Token(TokenKind::Include), r"%include\b"),
    (Rule::Token(TokenKind::Percent), r"%"),
    (Rule::Token(TokenKind::Sizeof), r"\bsizeof\b"),
    (
        Rule::Token(TokenKind::String),
        r#"[ubf]?r?"(?:[^"\\\n]|\\.)*""#,
    ),
    (
        Rule::Token(TokenKind::Char),
        r"'(?:\\0|\\n|\\r|\\'|\\t|\\\\|[ -&(-~])'",
    ),
    (Rule::Token(TokenKind::Identifier), r"[a-zA-Z_][a-zA-Z0-9_]*"),
];

/// The master pattern is built once per process; alternation order
/// follows [`PATTERNS`] so earlier branches win.
fn master_regex() -> &'static Regex {
    static MASTER: OnceLock<Regex> = OnceLock::new();
    MASTER.get_or_init(|| {
        let alternation = PATTERNS
            .iter()
            .enumerate()
            .map(|(i, (_, pattern))| format!("(?P<g{}>{})", i, pattern))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&alternation).expect("master token pattern must compile")
    })
}

/// Scanner over a single source buffer. Row and column are tracked for
/// every token; the sequence is terminated by a synthetic `Eof` token at
/// the final position.
pub struct Scanner<'src> {
    source: &'src str,
    file: String,
    pos: usize,
    row: usize,
    col: usize,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str, file: impl Into<String>) -> Self {
        Scanner {
            source,
            file: file.into(),
            pos: 0,
            row: 1,
            col: 1,
        }
    }

    fn location(&self) -> SourceLocation {
        SourceLocation::new(self.file.clone(), self.row, self.col)
    }

    /// Skip spaces, tabs and carriage returns. Newlines are handled by
    /// the master pattern so the row counter stays accurate.
    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.source[self.pos..].chars().next() {
            if ch == ' ' || ch == '\t' || ch == '\r' {
                self.pos += ch.len_utf8();
                self.col += 1;
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, CompileError> {
        loop {
            self.skip_whitespace();

            if self.pos >= self.source.len() {
                return Ok(None);
            }

            let caps = master_regex()
                .captures_at(self.source, self.pos)
                .filter(|caps| {
                    caps.get(0)
                        .is_some_and(|whole| whole.start() == self.pos)
                });

            let Some(caps) = caps else {
                let unexpected = self.source[self.pos..].chars().next().unwrap_or('\0');
                return Err(CompileError::scan(
                    format!("Unexpected character '{}'", unexpected),
                    self.location(),
                ));
            };

            let (index, matched) = PATTERNS
                .iter()
                .enumerate()
                .find_map(|(i, _)| caps.name(&format!("g{}", i)).map(|m| (i, m)))
                .expect("a branch of the master pattern matched");

            match PATTERNS[index].0 {
                Rule::Newline => {
                    self.row += 1;
                    self.col = 1;
                    self.pos = matched.end();
                }
                Rule::LineComment => {
                    self.pos = matched.end();
                }
                Rule::Token(kind) => {
                    let lexeme = matched.as_str();
                    let token = Token::new(kind, lexeme, self.location());
                    self.pos = matched.end();
                    self.col += lexeme.chars().count();
                    return Ok(Some(token));
                }
            }
        }
    }

    /// Consume the whole buffer, yielding every token plus the trailing
    /// `Eof` sentinel that downstream passes rely on.
    pub fn scan(mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();

        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }

        tokens.push(Token::new(TokenKind::Eof, "", self.location()));
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<Token> {
        Scanner::new(source, "test.hz").scan().unwrap()
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        scan(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_lexeme_matches_source_at_location() {
        let source = "proc main() -> i32 {\n    return 41 + 1;\n}\n";
        let lines: Vec<&str> = source.lines().collect();

        for token in scan(source) {
            if token.kind == TokenKind::Eof {
                continue;
            }
            let line = lines[token.location.row - 1];
            let start = token.location.col - 1;
            let slice: String = line.chars().skip(start).take(token.lexeme.chars().count()).collect();
            assert_eq!(slice, token.lexeme, "at {}", token.location);
        }
    }

    #[test]
    fn test_keywords_are_word_bounded() {
        let tokens = scan("proctor proc");
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(tokens[0].lexeme, "proctor");
        assert_eq!(tokens[1].kind, TokenKind::Proc);
    }

    #[test]
    fn test_two_character_operators_win() {
        assert_eq!(
            kinds("-> == != >= <= || &&"),
            vec![
                TokenKind::Arrow,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::GreaterEq,
                TokenKind::LessEq,
                TokenKind::Or,
                TokenKind::And,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_directives_and_registers_before_modulo() {
        assert_eq!(
            kinds("%define %include %rax %r15 %"),
            vec![
                TokenKind::Define,
                TokenKind::Include,
                TokenKind::Register,
                TokenKind::Register,
                TokenKind::Percent,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_literal_keeps_quotes_and_escapes() {
        let tokens = scan(r#"var s = "say \"hi\"";"#);
        let string = tokens.iter().find(|t| t.kind == TokenKind::String).unwrap();
        assert_eq!(string.lexeme, r#""say \"hi\"""#);
    }

    #[test]
    fn test_char_literals() {
        let tokens = scan(r"'a' '\n' '\0' '\\'");
        assert!(tokens[..4].iter().all(|t| t.kind == TokenKind::Char));
        assert_eq!(tokens[1].lexeme, r"'\n'");
    }

    #[test]
    fn test_row_and_col_tracking() {
        let tokens = scan("var x;\n  var y;");
        let y = tokens.iter().find(|t| t.lexeme == "y").unwrap();
        assert_eq!((y.location.row, y.location.col), (2, 7));
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("1 // comment with proc and var\n2"),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn test_unexpected_character_errors() {
        let err = Scanner::new("var x = `;", "bad.hz").scan().unwrap_err();
        assert!(err.to_string().contains("Unexpected character '`'"));
        assert_eq!(err.location().col, 9);
    }

    #[test]
    fn test_eof_sentinel_is_last() {
        let tokens = scan("return");
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn test_pop_and_drop_share_a_kind() {
        assert_eq!(
            kinds("pop drop"),
            vec![TokenKind::Pop, TokenKind::Pop, TokenKind::Eof]
        );
    }
}
