//! Inline policy configuration.
//!
//! ```text
//! Config   := (Property | Function) (Sep (Property | Function))* Sep? ("=>" Term)?
//! Property := Term (':' | '=') Term
//! Function := Term '(' (Term (',' Term)*)? ')'
//! Sep      := ',' | ';'
//! ```
//!
//! Names are case-insensitive. Terms may be quoted with `'` or `"`; function
//! arguments run up to the next `,` or `)` so dates such as
//! `offset(2024-03-01T08:30:00Z)` need no quoting.
//!
//! Example: `topic: orders; buffer(20), batch(10, 500), retry(3, 100), commit() => audit`
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{
    BatchPolicy, BufferPolicy, GroupBy, OffsetKind, OffsetPolicy, ParallelPolicy, Policy,
    PolicySet, RetryPolicy, DEFAULT_RETRY_DELAY,
};
use crate::error::ConfigError;

/// Result of parsing an inline configuration string.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineConfig {
    pub topic: Option<String>,
    pub policies: PolicySet,
    /// Handler named after `=>`, looked up in the handler registry
    pub handler: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Property { name: String, value: String },
    Function { name: String, args: Vec<String> },
}

/// Parse an inline configuration, resolving relative offset durations against now.
pub fn parse_inline(text: &str) -> Result<InlineConfig, ConfigError> {
    parse_inline_at(text, Utc::now())
}

pub fn parse_inline_at(text: &str, now: DateTime<Utc>) -> Result<InlineConfig, ConfigError> {
    let (entries, handler) = Parser::new(text).parse()?;

    let mut topic = None;
    let mut policies = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Entry::Property { name, value } => {
                let name = name.to_ascii_lowercase();
                if name == "topic" {
                    if topic.replace(value).is_some() {
                        return Err(ConfigError::DuplicatePolicy("topic"));
                    }
                    continue;
                }
                if let Some(policy) = property_policy(&name, &value, now)? {
                    policies.push(policy);
                }
            }
            Entry::Function { name, args } => {
                let name = name.to_ascii_lowercase();
                if name == "topic" {
                    let [value] = exact_args::<1>(&name, args)?;
                    if topic.replace(value).is_some() {
                        return Err(ConfigError::DuplicatePolicy("topic"));
                    }
                    continue;
                }
                if let Some(policy) = function_policy(&name, args, now)? {
                    policies.push(policy);
                }
            }
        }
    }

    Ok(InlineConfig {
        topic,
        policies: PolicySet::from_policies(policies)?,
        handler,
    })
}

fn property_policy(
    name: &str,
    value: &str,
    now: DateTime<Utc>,
) -> Result<Option<Policy>, ConfigError> {
    let policy = match name {
        "buffer" => Policy::Buffer(BufferPolicy {
            size: parse_number(name, value)?,
        }),
        "batch" => Policy::Batch(BatchPolicy {
            size: parse_number(name, value)?,
            time: Duration::ZERO,
        }),
        "parallel" => Policy::Parallel(ParallelPolicy {
            by: GroupBy::Partition,
            degree: parse_degree(name, value)?,
        }),
        "retry" => Policy::Retry(RetryPolicy::retry(
            parse_retries(name, value)?,
            DEFAULT_RETRY_DELAY,
        )),
        "skip" => {
            if !parse_bool(name, value)? {
                return Ok(None);
            }
            Policy::Retry(RetryPolicy::Skip)
        }
        "commit" => {
            if !parse_bool(name, value)? {
                return Ok(None);
            }
            Policy::Commit
        }
        "state" => Policy::State {
            enabled: parse_state(name, value)?,
        },
        "offset" => Policy::Offset(parse_offset(&[value.to_string()], now)?),
        _ => return Err(ConfigError::UnknownName(name.to_string())),
    };
    Ok(Some(policy))
}

fn function_policy(
    name: &str,
    args: Vec<String>,
    now: DateTime<Utc>,
) -> Result<Option<Policy>, ConfigError> {
    let policy = match name {
        "buffer" => {
            let [size] = exact_args::<1>(name, args)?;
            Policy::Buffer(BufferPolicy {
                size: parse_number(name, &size)?,
            })
        }
        "batch" => {
            check_arity(name, &args, 1, 2)?;
            Policy::Batch(BatchPolicy {
                size: parse_number(name, &args[0])?,
                time: match args.get(1) {
                    Some(time) => parse_millis(name, time)?,
                    None => Duration::ZERO,
                },
            })
        }
        "parallel" => {
            check_arity(name, &args, 1, 2)?;
            match args[0].parse::<i32>() {
                // parallel(N): partition lanes
                Ok(degree) if args.len() == 1 => Policy::Parallel(ParallelPolicy {
                    by: GroupBy::Partition,
                    degree,
                }),
                _ => Policy::Parallel(ParallelPolicy {
                    by: parse_group_by(&args[0]),
                    degree: match args.get(1) {
                        Some(degree) => parse_degree(name, degree)?,
                        None => ParallelPolicy::UNBOUNDED,
                    },
                }),
            }
        }
        "retry" => {
            check_arity(name, &args, 1, 2)?;
            Policy::Retry(RetryPolicy::retry(
                parse_retries(name, &args[0])?,
                match args.get(1) {
                    Some(delay) => parse_millis(name, delay)?,
                    None => DEFAULT_RETRY_DELAY,
                },
            ))
        }
        "skip" => {
            check_arity(name, &args, 0, 0)?;
            Policy::Retry(RetryPolicy::Skip)
        }
        "commit" => {
            check_arity(name, &args, 0, 0)?;
            Policy::Commit
        }
        "state" => {
            let [state] = exact_args::<1>(name, args)?;
            Policy::State {
                enabled: parse_state(name, &state)?,
            }
        }
        "offset" => {
            check_arity(name, &args, 1, 2)?;
            Policy::Offset(parse_offset(&args, now)?)
        }
        _ => return Err(ConfigError::UnknownName(name.to_string())),
    };
    Ok(Some(policy))
}

fn parse_offset(args: &[String], now: DateTime<Utc>) -> Result<OffsetPolicy, ConfigError> {
    match args.first().map(|a| a.parse::<OffsetKind>()) {
        Some(Ok(kind)) => {
            let bias = match args.get(1) {
                Some(bias) => bias.trim().parse::<i64>().map_err(|_| {
                    invalid("offset", format!("bias must be an integer, got {bias:?}"))
                })?,
                None => 0,
            };
            Ok(OffsetPolicy::new(kind, bias))
        }
        Some(Err(_)) if args.len() == 1 => {
            Ok(OffsetPolicy::as_of(OffsetPolicy::parse_as_of(&args[0], now)?))
        }
        Some(Err(kind_error)) => {
            // a date combined with a bias
            OffsetPolicy::parse_as_of(&args[0], now).map_err(|_| kind_error)?;
            Err(ConfigError::AmbiguousOffset)
        }
        None => Err(invalid("offset", "expected an offset kind or a date")),
    }
}

fn parse_group_by(value: &str) -> GroupBy {
    match value.to_ascii_lowercase().as_str() {
        "partition" => GroupBy::Partition,
        "key" => GroupBy::Key,
        _ => GroupBy::Field(value.to_string()),
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(name, format!("expected a non-negative integer, got {value:?}")))
}

fn parse_degree(name: &str, value: &str) -> Result<i32, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "unbounded" | "unlimited" => Ok(ParallelPolicy::UNBOUNDED),
        other => other
            .parse()
            .map_err(|_| invalid(name, format!("expected an integer degree, got {value:?}"))),
    }
}

fn parse_retries(name: &str, value: &str) -> Result<i32, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "infinite" | "forever" => Ok(RetryPolicy::INFINITE),
        other => other
            .parse()
            .map_err(|_| invalid(name, format!("expected a retry count, got {value:?}"))),
    }
}

/// Milliseconds, optionally suffixed with `ms`, `s` or `m`.
fn parse_millis(name: &str, value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(digits) = value.strip_suffix("ms") {
        (digits, 1)
    } else if let Some(digits) = value.strip_suffix('s') {
        (digits, 1_000)
    } else if let Some(digits) = value.strip_suffix('m') {
        (digits, 60_000)
    } else {
        (value.as_str(), 1)
    };

    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .map(Duration::from_millis)
        .ok_or_else(|| invalid(name, format!("expected a duration in milliseconds, got {value:?}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, format!("expected true or false, got {value:?}"))),
    }
}

fn parse_state(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "enabled" | "enable" | "on" | "true" => Ok(true),
        "disabled" | "disable" | "off" | "false" => Ok(false),
        _ => Err(invalid(
            name,
            format!("expected enabled or disabled, got {value:?}"),
        )),
    }
}

fn check_arity(name: &str, args: &[String], min: usize, max: usize) -> Result<(), ConfigError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(invalid(
            name,
            format!("expected {expected} arguments, got {}", args.len()),
        ));
    }
    Ok(())
}

fn exact_args<const N: usize>(name: &str, args: Vec<String>) -> Result<[String; N], ConfigError> {
    let count = args.len();
    args.try_into()
        .map_err(|_| invalid(name, format!("expected {N} arguments, got {count}")))
}

fn invalid(name: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidArgument {
        name: name.to_string(),
        message: message.into(),
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn parse(mut self) -> Result<(Vec<Entry>, Option<String>), ConfigError> {
        let mut entries = Vec::new();
        let mut handler = None;

        loop {
            self.skip_whitespace();
            if self.at_end() {
                break;
            }
            if self.at_arrow() {
                self.pos += 2;
                self.skip_whitespace();
                let position = self.pos;
                let term = self.term(&[',', ';', '(', ')'])?;
                if term.is_empty() {
                    return Err(self.error(position, "expected a handler name after '=>'"));
                }
                handler = Some(term);
                self.skip_whitespace();
                if !self.at_end() {
                    return Err(self.error(self.pos, "unexpected input after handler name"));
                }
                break;
            }

            entries.push(self.entry()?);

            self.skip_whitespace();
            match self.peek() {
                None => break,
                Some(',' | ';') => self.pos += 1,
                Some(_) if self.at_arrow() => {}
                Some(c) => {
                    return Err(self.error(self.pos, format!("expected ',' or ';', found {c:?}")))
                }
            }
        }

        if entries.is_empty() {
            return Err(self.error(0, "configuration contains no properties or functions"));
        }
        Ok((entries, handler))
    }

    fn entry(&mut self) -> Result<Entry, ConfigError> {
        let position = self.pos;
        let name = self.term(&[':', '=', '(', ')', ',', ';'])?;
        if name.is_empty() {
            return Err(self.error(position, "expected a property or function name"));
        }

        self.skip_whitespace();
        match self.peek() {
            Some(':') | Some('=') if !self.at_arrow() => {
                self.pos += 1;
                self.skip_whitespace();
                let value_position = self.pos;
                let value = self.term(&[',', ';', '(', ')'])?;
                if value.is_empty() {
                    return Err(self.error(value_position, format!("expected a value for {name}")));
                }
                Ok(Entry::Property { name, value })
            }
            Some('(') => {
                self.pos += 1;
                let args = self.arguments()?;
                Ok(Entry::Function { name, args })
            }
            _ => Err(self.error(
                self.pos,
                format!("expected ':', '=' or '(' after {name}"),
            )),
        }
    }

    fn arguments(&mut self) -> Result<Vec<String>, ConfigError> {
        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.pos += 1;
            return Ok(args);
        }

        loop {
            self.skip_whitespace();
            let position = self.pos;
            let arg = match self.peek() {
                Some(quote @ ('\'' | '"')) => self.quoted(quote)?,
                _ => {
                    let raw = self.take_while(|c| c != ',' && c != ')');
                    raw.trim().to_string()
                }
            };
            if arg.is_empty() {
                return Err(self.error(position, "empty argument"));
            }
            args.push(arg);

            self.skip_whitespace();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(')') => {
                    self.pos += 1;
                    return Ok(args);
                }
                _ => return Err(self.error(self.pos, "unclosed '('")),
            }
        }
    }

    /// A bare or quoted term. Bare terms end at whitespace, a stop character or `=>`.
    fn term(&mut self, stops: &[char]) -> Result<String, ConfigError> {
        if let Some(quote @ ('\'' | '"')) = self.peek() {
            return self.quoted(quote);
        }

        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || stops.contains(&c) || self.at_arrow() {
                break;
            }
            self.pos += c.len_utf8();
        }
        Ok(self.text[start..self.pos].to_string())
    }

    fn quoted(&mut self, quote: char) -> Result<String, ConfigError> {
        let start = self.pos;
        self.pos += quote.len_utf8();
        let body = self.take_while(|c| c != quote);
        if self.peek() != Some(quote) {
            return Err(self.error(start, "unterminated quoted term"));
        }
        self.pos += quote.len_utf8();
        Ok(body.to_string())
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !keep(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.text[start..self.pos]
    }

    fn skip_whitespace(&mut self) {
        self.take_while(char::is_whitespace);
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn at_arrow(&self) -> bool {
        self.text[self.pos..].starts_with("=>")
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn error(&self, position: usize, message: impl Into<String>) -> ConfigError {
        ConfigError::Syntax {
            position,
            message: message.into(),
        }
    }
}
