//! Token-level preprocessor: `%define` macros and `%include` splicing.
//!
//! The preprocessor rewrites a token stream into another token stream.
//! Macro bodies are preprocessed eagerly when defined, so nested macros
//! and includes inside a body resolve at definition time. Included files
//! are scanned and preprocessed with the *shared* macro/include state,
//! and a file is only ever spliced once per translation unit.

use crate::error::{CompileError, SourceLocation};
use crate::scanner::{Scanner, Token, TokenKind};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
struct Macro {
    params: Vec<String>,
    body: Vec<Token>,
}

/// Cursor over an owned token list. The trailing `Eof` sentinel is never
/// consumed by `advance`, so `peek` is always valid.
struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn new(tokens: Vec<Token>) -> Self {
        Cursor { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        self.pos += 1;
        token
    }

    fn available(&self) -> bool {
        self.pos < self.tokens.len() && self.peek().kind != TokenKind::Eof
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<Token, CompileError> {
        if self.check(kind) {
            return Ok(self.advance());
        }
        Err(CompileError::preprocess(
            message,
            self.peek().location.clone(),
        ))
    }

    fn terminator(&self) -> Option<&Token> {
        self.tokens.last()
    }
}

/// Macro table plus the include-once set, shared across the whole
/// translation unit including recursively included files.
#[derive(Default)]
pub struct Preprocessor {
    macros: HashMap<String, Macro>,
    included: HashSet<String>,
}

impl Preprocessor {
    pub fn new() -> Self {
        Preprocessor::default()
    }

    /// Rewrite `tokens` into the expanded stream. The input's trailing
    /// `Eof` is preserved as the output terminator.
    pub fn preprocess(
        &mut self,
        tokens: Vec<Token>,
        include_dirs: &[PathBuf],
    ) -> Result<Vec<Token>, CompileError> {
        let mut cur = Cursor::new(tokens);
        let mut out = Vec::new();

        while cur.available() {
            let token = cur.advance();

            match token.kind {
                TokenKind::Define => self.handle_define(&mut cur, include_dirs)?,
                TokenKind::Include => self.handle_include(&mut cur, &token, include_dirs, &mut out)?,
                TokenKind::Identifier => {
                    let expanded = self.expand_identifier(&mut cur, &token)?;
                    out.extend(expanded);
                }
                _ => out.push(token),
            }
        }

        if let Some(terminator) = cur.terminator() {
            out.push(terminator.clone());
        }
        Ok(out)
    }

    fn handle_define(
        &mut self,
        cur: &mut Cursor,
        include_dirs: &[PathBuf],
    ) -> Result<(), CompileError> {
        let name = cur.consume(TokenKind::Identifier, "Expected macro name")?;
        let mut params = Vec::new();

        if cur.matches(TokenKind::OpenParen) {
            loop {
                let param = cur.consume(TokenKind::Identifier, "Expected macro argument")?;
                params.push(param.lexeme);
                if !cur.matches(TokenKind::Comma) {
                    break;
                }
            }
            cur.consume(TokenKind::CloseParen, "Expected ')' for macro")?;
        }

        let mut body = Vec::new();

        if cur.matches(TokenKind::OpenSquare) {
            while !cur.check(TokenKind::CloseSquare) {
                if !cur.available() {
                    return Err(CompileError::preprocess(
                        "Expected ']' after macro definition",
                        name.location.clone(),
                    ));
                }
                body.push(cur.advance());
            }
            cur.consume(TokenKind::CloseSquare, "Expected ']' after macro definition")?;
        } else {
            if !cur.available() {
                return Err(CompileError::preprocess(
                    "Expected macro value",
                    name.location.clone(),
                ));
            }
            body.push(cur.advance());
        }

        if body.is_empty() {
            return Err(CompileError::preprocess(
                "Empty macro body",
                name.location.clone(),
            ));
        }

        // Resolve nested macros and includes inside the body now, so the
        // stored body is fully expanded.
        let terminator = Token::new(
            TokenKind::Eof,
            "",
            body.last().map(|t| t.location.clone()).unwrap_or(name.location.clone()),
        );
        body.push(terminator);
        let mut expanded = self.preprocess(body, include_dirs)?;
        expanded.pop();

        self.macros.insert(
            name.lexeme,
            Macro {
                params,
                body: expanded,
            },
        );
        Ok(())
    }

    fn handle_include(
        &mut self,
        cur: &mut Cursor,
        directive: &Token,
        include_dirs: &[PathBuf],
        out: &mut Vec<Token>,
    ) -> Result<(), CompileError> {
        let file = cur.consume(TokenKind::String, "Expected file name")?;
        let file_name = strip_quotes(&file.lexeme).to_string();

        if self.included.contains(&file_name) {
            return Ok(());
        }

        // First hit along the search path wins.
        let mut code = None;
        for dir in include_dirs {
            if let Ok(text) = fs::read_to_string(dir.join(&file_name)) {
                code = Some(text);
                break;
            }
        }

        let Some(code) = code else {
            return Err(CompileError::preprocess(
                format!("File '{}' not found", file_name),
                directive.location.clone(),
            ));
        };

        self.included.insert(file_name.clone());

        let tokens = Scanner::new(&code, file_name).scan()?;
        let mut spliced = self.preprocess(tokens, include_dirs)?;
        spliced.pop();
        out.extend(spliced);
        Ok(())
    }

    /// Expand an identifier if it names a macro; otherwise pass it through.
    fn expand_identifier(
        &mut self,
        cur: &mut Cursor,
        token: &Token,
    ) -> Result<Vec<Token>, CompileError> {
        let Some(makro) = self.macros.get(&token.lexeme).cloned() else {
            return Ok(vec![token.clone()]);
        };

        if makro.params.is_empty() {
            return Ok(makro.body.clone());
        }

        let args = self.collect_macro_args(cur, token, &makro)?;

        let mut out = Vec::new();
        for body_token in &makro.body {
            if body_token.kind == TokenKind::Identifier {
                if let Some(idx) = makro.params.iter().position(|p| *p == body_token.lexeme) {
                    out.extend(args[idx].iter().cloned());
                    continue;
                }
            }
            out.push(body_token.clone());
        }
        Ok(out)
    }

    /// Collect call-site arguments for a function-like macro. A comma
    /// separates arguments only at parenthesis depth 1; nested calls and
    /// parenthesized expressions pass through intact.
    fn collect_macro_args(
        &mut self,
        cur: &mut Cursor,
        token: &Token,
        makro: &Macro,
    ) -> Result<Vec<Vec<Token>>, CompileError> {
        let mut args: Vec<Vec<Token>> = Vec::new();

        if cur.matches(TokenKind::OpenParen) {
            let mut opens = 1usize;

            if cur.matches(TokenKind::CloseParen) {
                opens = 0;
            } else {
                loop {
                    let mut arg = Vec::new();

                    loop {
                        if !cur.available() {
                            break;
                        }
                        if cur.check(TokenKind::Comma) && opens == 1 {
                            break;
                        }

                        let tok = cur.advance();
                        match tok.kind {
                            TokenKind::OpenParen => {
                                opens += 1;
                                arg.push(tok);
                            }
                            TokenKind::CloseParen => {
                                opens -= 1;
                                if opens == 0 {
                                    break;
                                }
                                arg.push(tok);
                            }
                            TokenKind::Identifier => {
                                arg.extend(self.expand_identifier(cur, &tok)?);
                            }
                            _ => arg.push(tok),
                        }
                    }

                    args.push(arg);
                    if args.len() > makro.params.len() {
                        return Err(CompileError::preprocess(
                            "Too many arguments passed to macro",
                            token.location.clone(),
                        ));
                    }

                    if opens == 0 || !cur.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }

            if opens > 0 {
                return Err(CompileError::preprocess(
                    "Unclosed macro arguments",
                    token.location.clone(),
                ));
            }
        }

        if args.len() < makro.params.len() {
            return Err(CompileError::preprocess(
                "Too few arguments passed to macro",
                token.location.clone(),
            ));
        }

        Ok(args)
    }
}

/// Strip the surrounding quote characters from a string lexeme.
pub(crate) fn strip_quotes(lexeme: &str) -> &str {
    let mut chars = lexeme.chars();
    chars.next();
    chars.next_back();
    chars.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens_of(source: &str) -> Vec<Token> {
        Scanner::new(source, "test.hz").scan().unwrap()
    }

    fn preprocess(source: &str) -> Vec<Token> {
        Preprocessor::new()
            .preprocess(tokens_of(source), &[])
            .unwrap()
    }

    fn lexemes(tokens: &[Token]) -> Vec<&str> {
        tokens
            .iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .map(|t| t.lexeme.as_str())
            .collect()
    }

    #[test]
    fn test_object_macro_bare_body() {
        let out = preprocess("%define N 42 var x = N;");
        assert_eq!(lexemes(&out), vec!["var", "x", "=", "42", ";"]);
    }

    #[test]
    fn test_nested_macro_expansion() {
        let out = preprocess("%define B 1 %define A B A");
        assert_eq!(lexemes(&out), vec!["1"]);
    }

    #[test]
    fn test_function_macro_substitution() {
        let out = preprocess("%define SQ(x) [x * x] SQ(3+1)");
        assert_eq!(lexemes(&out), vec!["3", "+", "1", "*", "3", "+", "1"]);
    }

    #[test]
    fn test_function_macro_respects_nested_parens() {
        let out = preprocess("%define PAIR(a, b) [a + b] PAIR((1,2), 3)");
        assert_eq!(lexemes(&out), vec!["(", "1", ",", "2", ")", "+", "3"]);
    }

    #[test]
    fn test_too_many_macro_arguments() {
        let err = Preprocessor::new()
            .preprocess(tokens_of("%define ONE(x) x ONE(1, 2)"), &[])
            .unwrap_err();
        assert!(err.to_string().contains("Too many arguments"));
    }

    #[test]
    fn test_too_few_macro_arguments() {
        let err = Preprocessor::new()
            .preprocess(tokens_of("%define ADD(a, b) [a + b] ADD(1)"), &[])
            .unwrap_err();
        assert!(err.to_string().contains("Too few arguments"));
    }

    #[test]
    fn test_unclosed_macro_arguments() {
        let err = Preprocessor::new()
            .preprocess(tokens_of("%define ONE(x) x ONE(1"), &[])
            .unwrap_err();
        assert!(err.to_string().contains("Unclosed macro arguments"));
    }

    #[test]
    fn test_missing_include_file() {
        let err = Preprocessor::new()
            .preprocess(tokens_of("%include \"nope.hz\""), &[PathBuf::from(".")])
            .unwrap_err();
        assert!(err.to_string().contains("File 'nope.hz' not found"));
    }

    #[test]
    fn test_include_splices_and_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("defs.hz"), "var shared : u64;\n").unwrap();

        let once = Preprocessor::new()
            .preprocess(
                tokens_of("%include \"defs.hz\""),
                &[dir.path().to_path_buf()],
            )
            .unwrap();
        let twice = Preprocessor::new()
            .preprocess(
                tokens_of("%include \"defs.hz\" %include \"defs.hz\""),
                &[dir.path().to_path_buf()],
            )
            .unwrap();

        assert_eq!(lexemes(&once), vec!["var", "shared", ":", "u64", ";"]);
        assert_eq!(lexemes(&once), lexemes(&twice));
    }

    #[test]
    fn test_include_search_first_match_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(first.path().join("pick.hz"), "1").unwrap();
        fs::write(second.path().join("pick.hz"), "2").unwrap();

        let out = Preprocessor::new()
            .preprocess(
                tokens_of("%include \"pick.hz\""),
                &[first.path().to_path_buf(), second.path().to_path_buf()],
            )
            .unwrap();
        assert_eq!(lexemes(&out), vec!["1"]);
    }

    #[test]
    fn test_macro_body_preprocessed_at_definition() {
        // B is expanded into A's stored body, so redefining B later does
        // not change what A produces.
        let out = preprocess("%define B 1 %define A B %define B 2 A");
        assert_eq!(lexemes(&out), vec!["1"]);
    }

    #[test]
    fn test_trailing_eof_preserved() {
        let out = preprocess("%define N 1 N");
        assert_eq!(out.last().unwrap().kind, TokenKind::Eof);
    }
}
