#![allow(clippy::module_name_repetitions)]

//! Lexer and parser for the session console.
//!
//! `regal` turns a line into a bounded token stream and `winnow` parsers walk
//! the tokens. Nothing here allocates, so the firmware console and the host
//! emulator share the same grammar.

use core::fmt;
use core::ops::Range;

use heapless::Vec as HeaplessVec;
use regal::IncrementalError;
use regal::TokenCache;
use regal_macros::RegalLexer;
#[allow(deprecated)]
use winnow::error::ErrorKind;
use winnow::error::{ErrMode, ParserError};
use winnow::prelude::*;
use winnow::stream::Stream;

use crate::limits::PowerLimitSource;

/// Maximum number of tokens accepted per console line.
pub const MAX_TOKENS: usize = 16;
const MAX_CACHE_RECORDS: usize = MAX_TOKENS * 2;

#[derive(RegalLexer, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TokenKind {
    /// Signed decimal literal.
    #[regex(r"-?[0-9]+")]
    Integer,
    /// Keyword or name; matched case-insensitively by the parser.
    #[regex(r"[A-Za-z][A-Za-z0-9-]*")]
    Ident,
    #[regex(r"[ \t]+", skip)]
    Whitespace,
    #[token("\r\n")]
    #[token("\n")]
    #[token("\r")]
    Eol,
    #[default]
    #[regex(r".", priority = 1024)]
    Error,
}

/// Token with its byte span in the source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub span: Range<usize>,
}

pub type TokenBuffer<'a> = HeaplessVec<Token<'a>, MAX_TOKENS>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LexError {
    TooManyTokens { processed: usize },
    Engine,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::TooManyTokens { processed } => {
                write!(f, "line too long ({processed} tokens)")
            }
            LexError::Engine => f.write_str("lexer failure"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarErrorKind<'a> {
    UnexpectedToken {
        expected: &'static str,
        found: &'a str,
        span: Range<usize>,
    },
    UnexpectedEnd {
        expected: &'static str,
    },
    InvalidInteger {
        lexeme: &'a str,
    },
    UnknownSource {
        lexeme: &'a str,
    },
    InvalidToken {
        lexeme: &'a str,
        span: Range<usize>,
    },
}

impl fmt::Display for GrammarErrorKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarErrorKind::UnexpectedToken {
                expected,
                found,
                span,
            } => write!(f, "expected {expected}, found `{found}` at {span:?}"),
            GrammarErrorKind::UnexpectedEnd { expected } => {
                write!(f, "expected {expected}")
            }
            GrammarErrorKind::InvalidInteger { lexeme } => {
                write!(f, "`{lexeme}` is out of range")
            }
            GrammarErrorKind::UnknownSource { lexeme } => {
                write!(f, "unknown limit source `{lexeme}`")
            }
            GrammarErrorKind::InvalidToken { lexeme, span } => {
                write!(f, "unsupported input `{lexeme}` at {span:?}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrammarError<'a> {
    pub kind: GrammarErrorKind<'a>,
}

impl fmt::Display for GrammarError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl<'a> GrammarError<'a> {
    fn unexpected(expected: &'static str, token: Option<&Token<'a>>) -> Self {
        let kind = match token {
            Some(token) if token.kind == TokenKind::Eol => GrammarErrorKind::UnexpectedEnd { expected },
            Some(token) => GrammarErrorKind::UnexpectedToken {
                expected,
                found: token.lexeme,
                span: token.span.clone(),
            },
            None => GrammarErrorKind::UnexpectedEnd { expected },
        };
        GrammarError { kind }
    }

    fn with_kind(kind: GrammarErrorKind<'a>) -> Self {
        GrammarError { kind }
    }
}

type Input<'src, 'slice> = &'slice [Token<'src>];

#[allow(deprecated)]
impl<'src, 'slice> ParserError<Input<'src, 'slice>> for GrammarError<'src>
where
    'src: 'slice,
{
    fn from_error_kind(input: &Input<'src, 'slice>, _kind: ErrorKind) -> Self {
        GrammarError::unexpected("token", input.first())
    }

    fn append(
        self,
        _input: &Input<'src, 'slice>,
        _token_start: &<Input<'src, 'slice> as Stream>::Checkpoint,
        _kind: ErrorKind,
    ) -> Self {
        self
    }

    fn or(self, other: Self) -> Self {
        other
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError<'a> {
    Lex(LexError),
    Grammar(GrammarError<'a>),
}

impl fmt::Display for ParseError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Lex(err) => write!(f, "{err}"),
            ParseError::Grammar(err) => write!(f, "{err}"),
        }
    }
}

/// Parsed console command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Status,
    Stage,
    Limit(LimitCommand),
    /// Battery temperature in tenths of a degree C.
    Temp(i16),
    /// Power loss in mW.
    Loss(u32),
    Auth(AuthAction),
    Tick(Option<u16>),
    Connect,
    Disconnect,
    Help(Option<&'a str>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitCommand {
    Set(PowerLimitSource),
    Clear(PowerLimitSource),
    Reset,
}

/// How the simulated verifier answers the next challenge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthAction {
    Approve,
    Reject,
    /// Ready, but never answers.
    Hang,
    /// Never ready.
    Offline,
}

impl AuthAction {
    pub const fn label(self) -> &'static str {
        match self {
            AuthAction::Approve => "approve",
            AuthAction::Reject => "reject",
            AuthAction::Hang => "hang",
            AuthAction::Offline => "offline",
        }
    }
}

/// Splits `line` into tokens.
pub fn lex(line: &str) -> Result<TokenBuffer<'_>, LexError> {
    let compiled = TokenKind::lexer();
    let mut cache: TokenCache<TokenKind, MAX_CACHE_RECORDS> = TokenCache::new();
    let partial = cache
        .rebuild(compiled, line)
        .map_err(|error| match error {
            IncrementalError::TokenOverflow => LexError::TooManyTokens {
                processed: MAX_TOKENS,
            },
            _ => LexError::Engine,
        })?;

    let mut buffer = TokenBuffer::new();
    for record in cache.tokens() {
        if !record.skipped {
            push_token(&mut buffer, record.token, record.start, &line[record.start..record.end])?;
        }
    }
    if let Some(partial) = partial.filter(|partial| !partial.fragment.is_empty()) {
        push_token(&mut buffer, TokenKind::Error, partial.start, partial.fragment)?;
    }
    Ok(buffer)
}

fn push_token<'a>(
    buffer: &mut TokenBuffer<'a>,
    kind: TokenKind,
    start: usize,
    lexeme: &'a str,
) -> Result<(), LexError> {
    let token = Token {
        kind,
        lexeme,
        span: start..start + lexeme.len(),
    };
    buffer.push(token).map_err(|_| LexError::TooManyTokens {
        processed: MAX_TOKENS + 1,
    })
}

/// Parses one console line.
pub fn parse(line: &str) -> Result<Command<'_>, ParseError<'_>> {
    let tokens = lex(line).map_err(ParseError::Lex)?;

    if let Some(token) = tokens.iter().find(|token| token.kind == TokenKind::Error) {
        return Err(ParseError::Grammar(GrammarError::with_kind(
            GrammarErrorKind::InvalidToken {
                lexeme: token.lexeme,
                span: token.span.clone(),
            },
        )));
    }

    let mut input = tokens.as_slice();
    let command = match command().parse_next(&mut input) {
        Ok(command) => command,
        Err(ErrMode::Backtrack(err) | ErrMode::Cut(err)) => {
            return Err(ParseError::Grammar(err));
        }
        Err(ErrMode::Incomplete(_)) => {
            return Err(ParseError::Grammar(GrammarError::unexpected(
                "token",
                input.first(),
            )));
        }
    };

    if let Some(token) = input.iter().find(|token| token.kind != TokenKind::Eol) {
        return Err(ParseError::Grammar(GrammarError::unexpected(
            "end of command",
            Some(token),
        )));
    }
    Ok(command)
}

fn command<'src, 'slice>() -> impl Parser<Input<'src, 'slice>, Command<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let keyword = expect_kind(TokenKind::Ident, "command").parse_next(input)?;
        let name = keyword.lexeme;

        if name.eq_ignore_ascii_case("status") {
            Ok(Command::Status)
        } else if name.eq_ignore_ascii_case("stage") {
            Ok(Command::Stage)
        } else if name.eq_ignore_ascii_case("limit") {
            limit().parse_next(input).map(Command::Limit)
        } else if name.eq_ignore_ascii_case("temp") {
            let token = expect_kind(TokenKind::Integer, "temperature").parse_next(input)?;
            parse_number::<i16>(&token).map(Command::Temp)
        } else if name.eq_ignore_ascii_case("loss") {
            let token = expect_kind(TokenKind::Integer, "power loss").parse_next(input)?;
            parse_number::<u32>(&token).map(Command::Loss)
        } else if name.eq_ignore_ascii_case("auth") {
            auth_action().parse_next(input).map(Command::Auth)
        } else if name.eq_ignore_ascii_case("tick") {
            match optional_kind(input, TokenKind::Integer) {
                Some(token) => parse_number::<u16>(&token).map(|count| Command::Tick(Some(count))),
                None => Ok(Command::Tick(None)),
            }
        } else if name.eq_ignore_ascii_case("connect") {
            Ok(Command::Connect)
        } else if name.eq_ignore_ascii_case("disconnect") {
            Ok(Command::Disconnect)
        } else if name.eq_ignore_ascii_case("help") {
            Ok(Command::Help(
                optional_kind(input, TokenKind::Ident).map(|token| token.lexeme),
            ))
        } else {
            Err(ErrMode::Backtrack(GrammarError::unexpected(
                "command",
                Some(&keyword),
            )))
        }
    }
}

fn limit<'src, 'slice>() -> impl Parser<Input<'src, 'slice>, LimitCommand, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let action = expect_kind(TokenKind::Ident, "set, clear or reset").parse_next(input)?;
        if action.lexeme.eq_ignore_ascii_case("reset") {
            return Ok(LimitCommand::Reset);
        }
        let set = if action.lexeme.eq_ignore_ascii_case("set") {
            true
        } else if action.lexeme.eq_ignore_ascii_case("clear") {
            false
        } else {
            return Err(ErrMode::Backtrack(GrammarError::unexpected(
                "set, clear or reset",
                Some(&action),
            )));
        };

        let name = expect_kind(TokenKind::Ident, "limit source").parse_next(input)?;
        let source = PowerLimitSource::from_label(name.lexeme).ok_or_else(|| {
            ErrMode::Cut(GrammarError::with_kind(GrammarErrorKind::UnknownSource {
                lexeme: name.lexeme,
            }))
        })?;
        Ok(if set {
            LimitCommand::Set(source)
        } else {
            LimitCommand::Clear(source)
        })
    }
}

fn auth_action<'src, 'slice>() -> impl Parser<Input<'src, 'slice>, AuthAction, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let token = expect_kind(TokenKind::Ident, "approve, reject, hang or offline")
            .parse_next(input)?;
        [
            AuthAction::Approve,
            AuthAction::Reject,
            AuthAction::Hang,
            AuthAction::Offline,
        ]
        .into_iter()
        .find(|action| action.label().eq_ignore_ascii_case(token.lexeme))
        .ok_or_else(|| {
            ErrMode::Backtrack(GrammarError::unexpected(
                "approve, reject, hang or offline",
                Some(&token),
            ))
        })
    }
}

fn expect_kind<'src, 'slice>(
    kind: TokenKind,
    label: &'static str,
) -> impl Parser<Input<'src, 'slice>, Token<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| match input.split_first() {
        Some((token, rest)) if token.kind == kind => {
            *input = rest;
            Ok(token.clone())
        }
        other => Err(ErrMode::Backtrack(GrammarError::unexpected(
            label,
            other.map(|(token, _)| token),
        ))),
    }
}

fn optional_kind<'src>(input: &mut Input<'src, '_>, kind: TokenKind) -> Option<Token<'src>> {
    match input.split_first() {
        Some((token, rest)) if token.kind == kind => {
            *input = rest;
            Some(token.clone())
        }
        _ => None,
    }
}

fn parse_number<'a, T: core::str::FromStr>(token: &Token<'a>) -> Result<T, ErrMode<GrammarError<'a>>> {
    token.lexeme.parse::<T>().map_err(|_| {
        ErrMode::Cut(GrammarError::with_kind(GrammarErrorKind::InvalidInteger {
            lexeme: token.lexeme,
        }))
    })
}
