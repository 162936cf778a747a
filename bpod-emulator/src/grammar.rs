//! Lexer and parser for the emulator console.
//!
//! Lines are tokenized with `regal` into a bounded buffer, then `winnow`
//! parsers run over the token slice to build a [`Command`].

use core::fmt;
use core::ops::Range;
use core::time::Duration;

use heapless::Vec as HeaplessVec;
use regal::IncrementalError;
use regal::TokenCache;
use regal_macros::RegalLexer;
use winnow::combinator::opt;
use winnow::error::{ErrMode, ParserError};
use winnow::prelude::*;

/// Maximum number of tokens produced per console line.
pub const MAX_TOKENS: usize = 32;
const MAX_CACHE_RECORDS: usize = MAX_TOKENS * 2;

#[derive(RegalLexer, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TokenKind {
    /// Duration literal ending in `ms` or `s`, optionally fractional.
    #[regex(r"[0-9]+(?:\.[0-9]+)?(?:ms|s)", priority = 2)]
    Duration,
    #[regex(r"[0-9]+")]
    Integer,
    /// Command keyword, demo name or channel/event name.
    #[regex(r"[A-Za-z][A-Za-z0-9_-]*")]
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
                write!(f, "token buffer exhausted after {processed} items")
            }
            LexError::Engine => write!(f, "lexer engine error"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarErrorKind<'a> {
    UnexpectedToken {
        expected: &'static str,
        lexeme: &'a str,
        span: Range<usize>,
    },
    UnexpectedEnd {
        expected: &'static str,
    },
    UnknownCommand {
        lexeme: &'a str,
    },
    InvalidInteger {
        span: Range<usize>,
    },
    InvalidDuration {
        span: Range<usize>,
    },
    InvalidToken {
        span: Range<usize>,
        lexeme: &'a str,
    },
}

impl fmt::Display for GrammarErrorKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarErrorKind::UnexpectedToken {
                expected,
                lexeme,
                span,
            } => write!(f, "expected {expected}, found `{lexeme}` at {span:?}"),
            GrammarErrorKind::UnexpectedEnd { expected } => {
                write!(f, "unexpected end of input, expected {expected}")
            }
            GrammarErrorKind::UnknownCommand { lexeme } => {
                write!(f, "unknown command `{lexeme}`")
            }
            GrammarErrorKind::InvalidInteger { span } => {
                write!(f, "invalid integer literal at {span:?}")
            }
            GrammarErrorKind::InvalidDuration { span } => {
                write!(f, "invalid duration literal at {span:?}")
            }
            GrammarErrorKind::InvalidToken { span, lexeme } => {
                write!(f, "unsupported token `{lexeme}` at {span:?}")
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
        self.kind.fmt(f)
    }
}

impl<'a> GrammarError<'a> {
    fn unexpected(expected: &'static str, token: Option<&Token<'a>>) -> Self {
        GrammarError {
            kind: match token {
                Some(tok) => GrammarErrorKind::UnexpectedToken {
                    expected,
                    lexeme: tok.lexeme,
                    span: tok.span.clone(),
                },
                None => GrammarErrorKind::UnexpectedEnd { expected },
            },
        }
    }

    fn invalid_integer(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidInteger {
                span: token.span.clone(),
            },
        }
    }

    fn invalid_duration(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidDuration {
                span: token.span.clone(),
            },
        }
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
            ParseError::Lex(err) => err.fmt(f),
            ParseError::Grammar(err) => err.fmt(f),
        }
    }
}

/// Structured console commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Help { topic: Option<&'a str> },
    /// Print the channel map.
    Hardware,
    Demos,
    Load { demo: &'a str },
    /// Schedule `event` at `at` after trial start.
    Stim { event: &'a str, at: Duration },
    Clear,
    Run { trials: u32 },
    Trials,
    Override { channel: &'a str, value: u8 },
}

pub fn lex(line: &str) -> Result<TokenBuffer<'_>, LexError> {
    let compiled = TokenKind::lexer();
    let mut cache: TokenCache<TokenKind, MAX_CACHE_RECORDS> = TokenCache::new();
    let partial = cache
        .rebuild(compiled, line)
        .map_err(map_incremental_error)?;
    let mut buffer = TokenBuffer::new();

    for record in cache.tokens() {
        if record.skipped {
            continue;
        }
        let span = record.start..record.end;
        let token = Token {
            kind: record.token,
            lexeme: &line[span.clone()],
            span,
        };
        if buffer.push(token).is_err() {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    if let Some(partial) = partial.filter(|partial| !partial.fragment.is_empty()) {
        let start = partial.start;
        let token = Token {
            kind: TokenKind::Error,
            lexeme: partial.fragment,
            span: start..start + partial.fragment.len(),
        };
        if buffer.push(token).is_err() {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    Ok(buffer)
}

fn map_incremental_error(error: IncrementalError) -> LexError {
    match error {
        IncrementalError::TokenOverflow => LexError::TooManyTokens {
            processed: MAX_TOKENS,
        },
        _ => LexError::Engine,
    }
}

type Input<'src, 'slice> = &'slice [Token<'src>];

impl<'src, 'slice> ParserError<Input<'src, 'slice>> for GrammarError<'src>
where
    'src: 'slice,
{
    type Inner = Self;

    fn from_input(input: &Input<'src, 'slice>) -> Self {
        GrammarError::unexpected("token", input.first())
    }

    fn into_inner(self) -> Result<Self::Inner, Self> {
        Ok(self)
    }
}

fn parse_tokens_partial<'src, 'slice>(
    tokens: &'slice [Token<'src>],
) -> Result<(Command<'src>, &'slice [Token<'src>]), GrammarError<'src>>
where
    'src: 'slice,
{
    let mut input = tokens;
    match command().parse_next(&mut input) {
        Ok(parsed) => Ok((parsed, input)),
        Err(ErrMode::Backtrack(err) | ErrMode::Cut(err)) => Err(err),
        Err(ErrMode::Incomplete(_)) => Err(GrammarError::unexpected("token", input.first())),
    }
}

/// Parse a console command from the provided line.
pub fn parse(line: &str) -> Result<Command<'_>, ParseError<'_>> {
    let tokens = lex(line).map_err(ParseError::Lex)?;

    if let Some(token) = tokens.iter().find(|token| token.kind == TokenKind::Error) {
        return Err(ParseError::Grammar(GrammarError {
            kind: GrammarErrorKind::InvalidToken {
                span: token.span.clone(),
                lexeme: token.lexeme,
            },
        }));
    }

    let (parsed, rest) = parse_tokens_partial(tokens.as_slice()).map_err(ParseError::Grammar)?;

    match rest.iter().find(|token| token.kind != TokenKind::Eol) {
        Some(token) => Err(ParseError::Grammar(GrammarError::unexpected(
            "end of command",
            Some(token),
        ))),
        None => Ok(parsed),
    }
}

fn command<'src, 'slice>()
-> impl Parser<Input<'src, 'slice>, Command<'src>, ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| -> Result<Command<'src>, ErrMode<GrammarError<'src>>> {
        let keyword = expect_kind(TokenKind::Ident, "command keyword").parse_next(input)?;
        let lexeme = keyword.lexeme;
        let is = |name: &str| lexeme.eq_ignore_ascii_case(name);

        if is("help") {
            let topic = opt(expect_kind(TokenKind::Ident, "help topic")).parse_next(input)?;
            Ok(Command::Help {
                topic: topic.map(|token| token.lexeme),
            })
        } else if is("hardware") {
            Ok(Command::Hardware)
        } else if is("demos") {
            Ok(Command::Demos)
        } else if is("load") {
            let demo = expect_kind(TokenKind::Ident, "demo name").parse_next(input)?;
            Ok(Command::Load { demo: demo.lexeme })
        } else if is("stim") {
            let event = expect_kind(TokenKind::Ident, "event name").parse_next(input)?;
            opt(word("at")).parse_next(input)?;
            let token = expect_kind(TokenKind::Duration, "duration").parse_next(input)?;
            let at = parse_duration(&token).map_err(ErrMode::Cut)?;
            Ok(Command::Stim {
                event: event.lexeme,
                at,
            })
        } else if is("clear") {
            Ok(Command::Clear)
        } else if is("run") {
            let count = opt(expect_kind(TokenKind::Integer, "trial count")).parse_next(input)?;
            let trials = match count {
                Some(token) => parse_integer(&token).map_err(ErrMode::Cut)?,
                None => 1,
            };
            Ok(Command::Run { trials })
        } else if is("trials") {
            Ok(Command::Trials)
        } else if is("override") {
            let channel = expect_kind(TokenKind::Ident, "output channel").parse_next(input)?;
            let token = expect_kind(TokenKind::Integer, "output value").parse_next(input)?;
            let value = parse_integer(&token)
                .and_then(|value| {
                    u8::try_from(value).map_err(|_| GrammarError::invalid_integer(&token))
                })
                .map_err(ErrMode::Cut)?;
            Ok(Command::Override {
                channel: channel.lexeme,
                value,
            })
        } else {
            Err(ErrMode::Cut(GrammarError {
                kind: GrammarErrorKind::UnknownCommand { lexeme },
            }))
        }
    }
}

fn expect_kind<'src, 'slice>(
    kind: TokenKind,
    label: &'static str,
) -> impl Parser<Input<'src, 'slice>, Token<'src>, ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| match input.split_first() {
        Some((token, rest)) if token.kind == kind => {
            *input = rest;
            Ok(token.clone())
        }
        Some((token, _)) if token.kind != TokenKind::Eol => Err(ErrMode::Backtrack(
            GrammarError::unexpected(label, Some(token)),
        )),
        _ => Err(ErrMode::Backtrack(GrammarError::unexpected(label, None))),
    }
}

/// Matches the identifier `expected`, ignoring case.
fn word<'src, 'slice>(
    expected: &'static str,
) -> impl Parser<Input<'src, 'slice>, Token<'src>, ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let checkpoint = *input;
        let token = expect_kind(TokenKind::Ident, expected).parse_next(input)?;
        if token.lexeme.eq_ignore_ascii_case(expected) {
            Ok(token)
        } else {
            *input = checkpoint;
            Err(ErrMode::Backtrack(GrammarError::unexpected(
                expected,
                Some(&token),
            )))
        }
    }
}

fn parse_integer<'a>(token: &Token<'a>) -> Result<u32, GrammarError<'a>> {
    token
        .lexeme
        .parse::<u32>()
        .map_err(|_| GrammarError::invalid_integer(token))
}

fn parse_duration<'a>(token: &Token<'a>) -> Result<Duration, GrammarError<'a>> {
    let text = token.lexeme;
    let (number, scale) = if let Some(rest) = text.strip_suffix("ms") {
        (rest, 1_000.0)
    } else if let Some(rest) = text.strip_suffix('s') {
        (rest, 1.0)
    } else {
        return Err(GrammarError::invalid_duration(token));
    };
    let value = number
        .parse::<f64>()
        .map_err(|_| GrammarError::invalid_duration(token))?;
    Duration::try_from_secs_f64(value / scale).map_err(|_| GrammarError::invalid_duration(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(input: &str) -> Command<'_> {
        parse(input).expect("command should parse")
    }

    #[test]
    fn parses_bare_keywords_case_insensitively() {
        assert_eq!(parse_ok("HARDWARE"), Command::Hardware);
        assert_eq!(parse_ok("demos\n"), Command::Demos);
        assert_eq!(parse_ok("Trials"), Command::Trials);
        assert_eq!(parse_ok("help"), Command::Help { topic: None });
        assert_eq!(parse_ok("help stim"), Command::Help { topic: Some("stim") });
    }

    #[test]
    fn parses_stimuli_with_and_without_at() {
        match parse_ok("stim Port1In at 1.5s") {
            Command::Stim { event, at } => {
                assert_eq!(event, "Port1In");
                assert_eq!(at, Duration::from_millis(1_500));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        match parse_ok("stim GlobalTimer1_End 250ms") {
            Command::Stim { event, at } => {
                assert_eq!(event, "GlobalTimer1_End");
                assert_eq!(at, Duration::from_millis(250));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn run_defaults_to_one_trial() {
        assert_eq!(parse_ok("run"), Command::Run { trials: 1 });
        assert_eq!(parse_ok("run 3"), Command::Run { trials: 3 });
    }

    #[test]
    fn load_and_override_take_arguments() {
        assert_eq!(parse_ok("load two-afc"), Command::Load { demo: "two-afc" });
        assert_eq!(
            parse_ok("override PWM1 128"),
            Command::Override {
                channel: "PWM1",
                value: 128
            }
        );
    }

    #[test]
    fn rejects_out_of_range_override_values() {
        let err = parse("override PWM1 300").expect_err("value must fit a byte");
        assert!(matches!(
            err,
            ParseError::Grammar(GrammarError {
                kind: GrammarErrorKind::InvalidInteger { .. }
            })
        ));
    }

    #[test]
    fn rejects_trailing_tokens_and_unknown_commands() {
        assert!(matches!(
            parse("demos extra"),
            Err(ParseError::Grammar(GrammarError {
                kind: GrammarErrorKind::UnexpectedToken { .. }
            }))
        ));
        assert!(matches!(
            parse("reboot"),
            Err(ParseError::Grammar(GrammarError {
                kind: GrammarErrorKind::UnknownCommand { lexeme: "reboot" }
            }))
        ));
    }

    #[test]
    fn optional_arguments_backtrack_to_the_next_expectation() {
        assert_eq!(
            parse("stim Port1In soon 1s").unwrap_err().to_string(),
            "expected duration, found `soon` at 13..17"
        );
        assert_eq!(
            parse("run many").unwrap_err().to_string(),
            "expected end of command, found `many` at 4..8"
        );
        assert_eq!(
            parse_tokens_partial(&lex("run 2 3").unwrap())
                .map(|(parsed, rest)| (parsed, rest.len())),
            Ok((Command::Run { trials: 2 }, 1))
        );
    }

    #[test]
    fn missing_duration_reports_end_of_input() {
        let err = parse("stim Port1In").expect_err("duration is required");
        assert_eq!(err.to_string(), "unexpected end of input, expected duration");
    }

    #[test]
    fn rejects_unsupported_characters() {
        assert!(matches!(
            parse("run $"),
            Err(ParseError::Grammar(GrammarError {
                kind: GrammarErrorKind::InvalidToken { lexeme: "$", .. }
            }))
        ));
    }
}
