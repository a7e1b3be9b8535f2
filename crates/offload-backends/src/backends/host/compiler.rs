//! Kernel front end for the host backend
//!
//! The host backend does not generate code. It checks that a kernel source
//! is well formed and extracts each `__kernel` entry point with its parameter
//! list, which is enough to bind entry points to host implementations and to
//! reject broken sources with a compiler-style log:
//!
//! ```text
//! <source>:4:23: error: expected ';' before '}'
//!     C[i] = A[i] + B[i]
//!                       ^
//! ```
//!
//! Preprocessor lines are skipped, except `#error`, which fails the build.

use logos::Logos;
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
enum Token {
    #[token("/*", block_comment)]
    Comment,

    #[regex(r"#[^\n]*", |lex| lex.slice().to_string())]
    Directive(String),

    #[token("__kernel")]
    #[token("kernel")]
    Kernel,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9][0-9A-Za-z_.]*")]
    Number,

    #[regex(r#""([^"\\\n]|\\.)*""#)]
    Str,

    #[regex(r"'([^'\\\n]|\\.)+'")]
    Char,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token("*")]
    Star,

    #[regex(r"[+\-/%=<>!&|^~?:.]")]
    Op,
}

/// Skip to the closing `*/`. An unterminated comment swallows the rest of
/// the source and is reported as an error.
fn block_comment(lex: &mut logos::Lexer<Token>) -> logos::FilterResult<(), ()> {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            logos::FilterResult::Skip
        }
        None => {
            lex.bump(lex.remainder().len());
            logos::FilterResult::Error(())
        }
    }
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Comment => "comment".to_string(),
            Token::Directive(_) => "preprocessor directive".to_string(),
            Token::Kernel => "'__kernel'".to_string(),
            Token::Ident(name) => format!("'{name}'"),
            Token::Number => "number".to_string(),
            Token::Str => "string literal".to_string(),
            Token::Char => "character literal".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::Semi => "';'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Star => "'*'".to_string(),
            Token::Op => "operator".to_string(),
        }
    }
}

/// Memory region a pointer parameter refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    Global,
    Constant,
    Local,
    Private,
}

/// One declared kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDecl {
    pub name: String,
    /// Element type for pointers, value type otherwise (`int`, `unsigned int`).
    pub base_type: String,
    pub pointer: bool,
    pub address_space: AddressSpace,
}

/// One `__kernel` entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDecl {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
struct Diagnostic {
    severity: Severity,
    offset: usize,
    message: String,
}

/// Options accepted by [`compile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub defines: Vec<(String, Option<String>)>,
    pub include_dirs: Vec<String>,
    pub warnings_as_errors: bool,
    pub suppress_warnings: bool,
}

impl BuildOptions {
    /// Parse an option string such as `-D TILE=16 -cl-fast-relaxed-math`.
    ///
    /// # Errors
    ///
    /// Returns the offending option for anything not understood.
    pub fn parse(options: &str) -> Result<Self, String> {
        let mut parsed = BuildOptions::default();
        let mut words = options.split_whitespace();
        while let Some(word) = words.next() {
            match word {
                "-D" => {
                    let def = words.next().ok_or_else(|| "-D requires a macro name".to_string())?;
                    parsed.defines.push(split_define(def));
                }
                "-I" => {
                    let dir = words.next().ok_or_else(|| "-I requires a directory".to_string())?;
                    parsed.include_dirs.push(dir.to_string());
                }
                "-w" => parsed.suppress_warnings = true,
                "-Werror" => parsed.warnings_as_errors = true,
                _ if word.starts_with("-D") => parsed.defines.push(split_define(&word[2..])),
                _ if word.starts_with("-I") => parsed.include_dirs.push(word[2..].to_string()),
                _ if word.starts_with("-cl-") => {}
                _ => return Err(format!("unrecognized option '{word}'")),
            }
        }
        Ok(parsed)
    }
}

fn split_define(def: &str) -> (String, Option<String>) {
    match def.split_once('=') {
        Some((name, value)) => (name.to_string(), Some(value.to_string())),
        None => (def.to_string(), None),
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct CompiledSource {
    pub kernels: Vec<KernelDecl>,
    /// Rendered warnings; empty for a clean build.
    pub log: String,
}

/// Check `source` and extract its entry points.
///
/// `extra_warnings` are appended by the caller (for example kernels with no
/// host implementation) and are subject to `-w` / `-Werror` like any other.
///
/// # Errors
///
/// Returns the rendered build log when the source has errors.
pub fn compile(
    source: &str,
    options: &BuildOptions,
    extra_warnings: impl Fn(&KernelDecl) -> Option<String>,
) -> Result<CompiledSource, String> {
    let mut parser = Parser::new(source);
    parser.check_delimiters();
    if !parser.has_errors() {
        parser.parse_items();
    }

    if !parser.has_errors() {
        let warnings: Vec<(usize, String)> = parser
            .kernels
            .iter()
            .filter_map(|kernel| extra_warnings(kernel).map(|message| (parser.lines.line_start(kernel.line), message)))
            .collect();
        for (offset, message) in warnings {
            parser.warn(offset, message);
        }
    }

    let Parser {
        kernels,
        diagnostics,
        lines,
        ..
    } = parser;
    let mut diagnostics = diagnostics;
    if options.suppress_warnings {
        diagnostics.retain(|d| d.severity == Severity::Error);
    } else if options.warnings_as_errors {
        for diagnostic in &mut diagnostics {
            diagnostic.severity = Severity::Error;
        }
    }

    let log = diagnostics
        .iter()
        .map(|d| lines.render(source, d))
        .collect::<Vec<_>>()
        .join("\n");

    if diagnostics.iter().any(|d| d.severity == Severity::Error) {
        return Err(log);
    }
    Ok(CompiledSource { kernels, log })
}

const QUALIFIERS: &[&str] = &[
    "__global", "global", "__constant", "constant", "__local", "local", "__private", "private", "const", "restrict",
    "__restrict", "volatile",
];

struct Parser<'s> {
    tokens: Vec<(Token, Range<usize>)>,
    pos: usize,
    source: &'s str,
    lines: LineIndex,
    kernels: Vec<KernelDecl>,
    diagnostics: Vec<Diagnostic>,
}

impl<'s> Parser<'s> {
    fn new(source: &'s str) -> Self {
        let mut tokens = Vec::new();
        let mut diagnostics = Vec::new();
        for (token, span) in Token::lexer(source).spanned() {
            match token {
                Ok(token) => tokens.push((token, span)),
                Err(()) => {
                    let text = &source[span.clone()];
                    let message = if text.starts_with("/*") {
                        "unterminated comment".to_string()
                    } else {
                        format!("invalid character '{text}'")
                    };
                    diagnostics.push(Diagnostic {
                        severity: Severity::Error,
                        offset: span.start,
                        message,
                    });
                }
            }
        }
        Self {
            tokens,
            pos: 0,
            source,
            lines: LineIndex::new(source),
            kernels: Vec::new(),
            diagnostics,
        }
    }

    fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    fn error(&mut self, offset: usize, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Error,
            offset,
            message: message.into(),
        });
    }

    fn warn(&mut self, offset: usize, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            offset,
            message: message.into(),
        });
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, span)| span.start)
            .unwrap_or(self.source.len())
    }

    fn previous_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|(_, span)| span.end)
            .unwrap_or(0)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Report the first unbalanced `()`, `[]` or `{}`.
    fn check_delimiters(&mut self) {
        let mut stack: Vec<(&Token, usize)> = Vec::new();
        let mut failure = None;
        for (token, span) in &self.tokens {
            let expected_open = match token {
                Token::LParen | Token::LBracket | Token::LBrace => {
                    stack.push((token, span.start));
                    continue;
                }
                Token::RParen => Token::LParen,
                Token::RBracket => Token::LBracket,
                Token::RBrace => Token::LBrace,
                _ => continue,
            };
            match stack.pop() {
                Some((open, _)) if *open == expected_open => {}
                Some((open, open_at)) => {
                    failure = Some((
                        span.start,
                        format!("{} does not match {} opened at offset {open_at}", token.describe(), open.describe()),
                    ));
                    break;
                }
                None => {
                    failure = Some((span.start, format!("unmatched {}", token.describe())));
                    break;
                }
            }
        }
        if failure.is_none() {
            if let Some((open, at)) = stack.pop() {
                failure = Some((at, format!("unterminated {}", open.describe())));
            }
        }
        if let Some((offset, message)) = failure {
            self.error(offset, message);
        }
    }

    fn parse_items(&mut self) {
        let mut seen = HashSet::new();
        while let Some(token) = self.peek().cloned() {
            match token {
                Token::Directive(text) => {
                    let offset = self.offset();
                    self.bump();
                    let directive = text.trim_start_matches('#').trim_start();
                    if let Some(message) = directive.strip_prefix("error") {
                        self.error(offset, format!("#error{message}"));
                    }
                }
                Token::Kernel => {
                    let offset = self.offset();
                    self.bump();
                    let Some(kernel) = self.parse_kernel(offset) else {
                        return;
                    };
                    if !seen.insert(kernel.name.clone()) {
                        self.error(offset, format!("redefinition of kernel '{}'", kernel.name));
                    }
                    self.kernels.push(kernel);
                }
                _ => {
                    if !self.skip_item() {
                        return;
                    }
                }
            }
        }
    }

    /// Skip a non-kernel top-level item: a declaration ending in `;` or a
    /// function ending with its body.
    fn skip_item(&mut self) -> bool {
        let mut depth = 0usize;
        let mut previous = None;
        while let Some(token) = self.bump() {
            match token {
                Token::LParen | Token::LBracket => depth += 1,
                Token::RParen | Token::RBracket | Token::RBrace => depth = depth.saturating_sub(1),
                Token::Semi if depth == 0 => return true,
                Token::LBrace if depth == 0 && previous != Some(Token::Op) => return self.parse_body(),
                Token::LBrace => depth += 1,
                _ => {}
            }
            previous = Some(token);
        }
        true
    }

    fn parse_kernel(&mut self, start: usize) -> Option<KernelDecl> {
        let line = self.lines.position(start).0;

        match self.bump() {
            Some(Token::Ident(ty)) if ty == "void" => {}
            Some(other) => {
                let offset = self.previous_end();
                self.error(offset, format!("kernel functions must return void, found {}", other.describe()));
                return None;
            }
            None => {
                self.error(self.source.len(), "expected kernel declaration");
                return None;
            }
        }

        let name = match self.bump() {
            Some(Token::Ident(name)) => name,
            other => {
                let found = other.map(|t| t.describe()).unwrap_or_else(|| "end of input".to_string());
                self.error(self.previous_end(), format!("expected kernel name, found {found}"));
                return None;
            }
        };

        if self.peek() != Some(&Token::LParen) {
            self.error(self.offset(), format!("expected '(' after kernel name '{name}'"));
            return None;
        }
        self.bump();

        let params = self.parse_params(&name)?;

        if self.peek() != Some(&Token::LBrace) {
            self.error(self.offset(), format!("expected '{{' to begin the body of '{name}'"));
            return None;
        }
        self.bump();
        if !self.parse_body() {
            return None;
        }

        Some(KernelDecl { name, params, line })
    }

    fn parse_params(&mut self, kernel: &str) -> Option<Vec<ParamDecl>> {
        let mut params = Vec::new();
        let mut current: Vec<(Token, usize)> = Vec::new();
        loop {
            let offset = self.offset();
            let token = match self.bump() {
                Some(token) => token,
                None => {
                    self.error(offset, "unexpected end of input in parameter list");
                    return None;
                }
            };
            match token {
                Token::Comma | Token::RParen => {
                    let closing = token == Token::RParen;
                    let is_void = current.len() == 1 && matches!(&current[0].0, Token::Ident(t) if t == "void");
                    if closing && params.is_empty() && (current.is_empty() || is_void) {
                        return Some(params);
                    }
                    params.push(self.param_from(kernel, &current, offset)?);
                    current.clear();
                    if closing {
                        return Some(params);
                    }
                }
                other => current.push((other, offset)),
            }
        }
    }

    fn param_from(&mut self, kernel: &str, tokens: &[(Token, usize)], end: usize) -> Option<ParamDecl> {
        let Some((Token::Ident(name), name_at)) = tokens.last() else {
            self.error(end, format!("expected parameter name in '{kernel}'"));
            return None;
        };
        let mut pointer = false;
        let mut address_space = AddressSpace::Private;
        let mut type_words = Vec::new();
        for (token, at) in &tokens[..tokens.len() - 1] {
            match token {
                Token::Star => pointer = true,
                Token::Ident(word) if QUALIFIERS.contains(&word.as_str()) => {
                    match word.trim_start_matches("__") {
                        "global" => address_space = AddressSpace::Global,
                        "constant" => address_space = AddressSpace::Constant,
                        "local" => address_space = AddressSpace::Local,
                        "private" => address_space = AddressSpace::Private,
                        _ => {}
                    }
                }
                Token::Ident(word) => type_words.push(word.as_str()),
                other => {
                    self.error(*at, format!("unexpected {} in parameter list", other.describe()));
                    return None;
                }
            }
        }
        if type_words.is_empty() {
            self.error(*name_at, format!("parameter '{name}' has no type"));
            return None;
        }
        if pointer && address_space == AddressSpace::Private {
            self.error(
                *name_at,
                format!("pointer parameter '{name}' of kernel '{kernel}' must be __global, __constant or __local"),
            );
            return None;
        }
        Some(ParamDecl {
            name: name.clone(),
            base_type: type_words.join(" "),
            pointer,
            address_space,
        })
    }

    /// Consume a `{ ... }` body whose opening brace was already taken.
    ///
    /// A statement block must close after `;`, `{` or `}`; anything else means
    /// the last statement lacks its semicolon. Initializer lists are exempt.
    fn parse_body(&mut self) -> bool {
        // One entry per open brace: true for statement blocks.
        let mut blocks = vec![true];
        let mut previous = Token::LBrace;
        while let Some(token) = self.bump() {
            match &token {
                Token::LBrace => {
                    let parent_is_block = blocks.last().copied().unwrap_or(true);
                    let initializer = matches!(previous, Token::Op | Token::Comma | Token::LParen)
                        || (!parent_is_block && previous == Token::LBrace);
                    blocks.push(!initializer);
                }
                Token::RBrace => {
                    let is_block = blocks.pop().unwrap_or(true);
                    if is_block && !matches!(previous, Token::Semi | Token::LBrace | Token::RBrace) {
                        let at = self.pos.saturating_sub(2);
                        let offset = self.tokens.get(at).map(|(_, span)| span.end).unwrap_or(0);
                        self.error(offset, "expected ';' before '}'");
                        return false;
                    }
                    if blocks.is_empty() {
                        return true;
                    }
                }
                Token::Kernel => {
                    self.error(self.previous_end(), "kernel declarations cannot be nested");
                    return false;
                }
                _ => {}
            }
            previous = token;
        }
        false
    }
}

struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { starts }
    }

    /// 1-based line and column of a byte offset.
    fn position(&self, offset: usize) -> (usize, usize) {
        let line = match self.starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        (line + 1, offset - self.starts[line] + 1)
    }

    fn line_start(&self, line: usize) -> usize {
        self.starts.get(line.saturating_sub(1)).copied().unwrap_or(0)
    }

    fn render(&self, source: &str, diagnostic: &Diagnostic) -> String {
        let offset = diagnostic.offset.min(source.len());
        let (line, column) = self.position(offset);
        let start = self.starts[line - 1];
        let text = source[start..].lines().next().unwrap_or("");
        format!(
            "<source>:{line}:{column}: {}: {}\n{text}\n{:>width$}",
            diagnostic.severity,
            diagnostic.message,
            "^",
            width = column
        )
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => f.write_str("error"),
            Severity::Warning => f.write_str("warning"),
        }
    }
}
