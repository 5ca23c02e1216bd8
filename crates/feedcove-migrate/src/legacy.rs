//! Decoder for the legacy "repr" storage convention.
//!
//! Early releases serialized container-typed columns and fields by rendering
//! the value as source-level literal text (`"{u'a': [1, 2]}"`). Relational-era
//! upgrade steps read those blobs back through [`decode_legacy_value`], the
//! single place that convention is understood.
//!
//! The decoder is deliberately a narrow recursive-descent parser, not an
//! expression evaluator. It accepts exactly the literal shapes the old
//! writers produced — scalars, strings (with `u`/`b` prefixes and `L`
//! integer suffixes), lists, tuples, dicts — plus a fixed vocabulary of
//! date/time constructors. Every other name or call is rejected.

use chrono::{NaiveDate, NaiveDateTime};

use crate::value::Value;

/// Errors produced while decoding legacy value text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LegacyValueError {
    /// An unexpected character was found.
    #[error("unexpected character {ch:?} at byte {pos}")]
    UnexpectedChar {
        /// The offending character.
        ch: char,
        /// Byte offset into the input.
        pos: usize,
    },

    /// The input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A name or call outside the legacy vocabulary.
    #[error("{0:?} is not part of the legacy literal vocabulary")]
    DisallowedName(String),

    /// A numeric literal that does not fit the expected shape.
    #[error("invalid number literal {0:?}")]
    InvalidNumber(String),

    /// A date/time constructor with out-of-range or missing arguments.
    #[error("invalid date/time literal: {0}")]
    InvalidDateTime(String),

    /// Extra input after a complete value.
    #[error("trailing input at byte {0}")]
    TrailingInput(usize),
}

/// Decodes one legacy-encoded value.
///
/// # Errors
///
/// Fails on any input that is not a complete literal in the legacy
/// vocabulary. The decoder never guesses or repairs; callers that tolerate
/// row-scoped corruption catch the error and apply their documented
/// fallback.
pub fn decode_legacy_value(text: &str) -> Result<Value, LegacyValueError> {
    let mut decoder = Decoder::new(text);
    let value = decoder.parse_value()?;
    decoder.skip_whitespace();
    if decoder.peek().is_some() {
        return Err(LegacyValueError::TrailingInput(decoder.pos));
    }
    Ok(value)
}

struct Decoder<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Decoder<'a> {
    const fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), LegacyValueError> {
        self.skip_whitespace();
        match self.peek() {
            Some(c) if c == ch => {
                self.advance();
                Ok(())
            }
            Some(c) => Err(LegacyValueError::UnexpectedChar { ch: c, pos: self.pos }),
            None => Err(LegacyValueError::UnexpectedEof),
        }
    }

    fn parse_value(&mut self) -> Result<Value, LegacyValueError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(LegacyValueError::UnexpectedEof),
            Some('[') => self.parse_list(),
            Some('(') => self.parse_tuple(),
            Some('{') => self.parse_dict(),
            Some('\'') | Some('"') => self.parse_string().map(Value::Text),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                self.parse_number()
            }
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_name(),
            Some(c) => Err(LegacyValueError::UnexpectedChar { ch: c, pos: self.pos }),
        }
    }

    fn parse_list(&mut self) -> Result<Value, LegacyValueError> {
        self.expect('[')?;
        let items = self.parse_sequence(']')?;
        Ok(Value::List(items))
    }

    fn parse_tuple(&mut self) -> Result<Value, LegacyValueError> {
        self.expect('(')?;
        let items = self.parse_sequence(')')?;
        Ok(Value::Tuple(items))
    }

    /// Parses comma-separated values up to `close`, tolerating a trailing
    /// comma (Python repr emits one for 1-tuples).
    fn parse_sequence(&mut self, close: char) -> Result<Vec<Value>, LegacyValueError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(close) {
                self.advance();
                return Ok(items);
            }
            items.push(self.parse_value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some(c) if c == close => {}
                Some(c) => {
                    return Err(LegacyValueError::UnexpectedChar { ch: c, pos: self.pos })
                }
                None => return Err(LegacyValueError::UnexpectedEof),
            }
        }
    }

    fn parse_dict(&mut self) -> Result<Value, LegacyValueError> {
        self.expect('{')?;
        let mut pairs = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some('}') {
                self.advance();
                return Ok(Value::Map(pairs));
            }
            let key = self.parse_value()?;
            self.expect(':')?;
            let value = self.parse_value()?;
            pairs.push((key, value));
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some('}') => {}
                Some(c) => {
                    return Err(LegacyValueError::UnexpectedChar { ch: c, pos: self.pos })
                }
                None => return Err(LegacyValueError::UnexpectedEof),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String, LegacyValueError> {
        let quote = self.advance().ok_or(LegacyValueError::UnexpectedEof)?;
        let mut out = String::new();
        loop {
            match self.advance() {
                None => return Err(LegacyValueError::UnexpectedEof),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let esc = self.advance().ok_or(LegacyValueError::UnexpectedEof)?;
                    match esc {
                        '\\' => out.push('\\'),
                        '\'' => out.push('\''),
                        '"' => out.push('"'),
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        'x' => {
                            let hi = self.advance().ok_or(LegacyValueError::UnexpectedEof)?;
                            let lo = self.advance().ok_or(LegacyValueError::UnexpectedEof)?;
                            let code = u32::from_str_radix(&format!("{hi}{lo}"), 16).map_err(
                                |_| LegacyValueError::UnexpectedChar { ch: hi, pos: self.pos },
                            )?;
                            out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                        }
                        other => {
                            return Err(LegacyValueError::UnexpectedChar {
                                ch: other,
                                pos: self.pos,
                            })
                        }
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value, LegacyValueError> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.advance();
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {
                    self.advance();
                }
                '.' | 'e' | 'E' => {
                    is_float = true;
                    self.advance();
                    if matches!(self.peek(), Some('-') | Some('+')) {
                        self.advance();
                    }
                }
                // Python 2 long suffix.
                'L' => {
                    let text = &self.input[start..self.pos];
                    self.advance();
                    return text
                        .parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| LegacyValueError::InvalidNumber(text.to_string()));
                }
                _ => break,
            }
        }
        let text = &self.input[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| LegacyValueError::InvalidNumber(text.to_string()))
        } else {
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| LegacyValueError::InvalidNumber(text.to_string()))
        }
    }

    /// Parses a bare name: a keyword constant, a prefixed string, or one of
    /// the whitelisted date/time constructors.
    fn parse_name(&mut self) -> Result<Value, LegacyValueError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.')
        {
            self.advance();
        }
        let name = &self.input[start..self.pos];
        match name {
            "None" => Ok(Value::None),
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            // Python 2 unicode/bytes string prefixes.
            "u" | "b" if matches!(self.peek(), Some('\'') | Some('"')) => {
                self.parse_string().map(Value::Text)
            }
            "datetime.datetime" => self.parse_datetime_call(false),
            "datetime.date" => self.parse_datetime_call(true),
            "time.struct_time" => self.parse_struct_time_call(),
            other => Err(LegacyValueError::DisallowedName(other.to_string())),
        }
    }

    /// Parses the arguments of a call: positional values and `name=value`
    /// pairs, in any mix.
    fn parse_call_args(
        &mut self,
    ) -> Result<(Vec<Value>, Vec<(String, Value)>), LegacyValueError> {
        self.expect('(')?;
        let mut positional = Vec::new();
        let mut named = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(')') {
                self.advance();
                return Ok((positional, named));
            }
            // Look ahead for `ident=` without consuming a value expression.
            let mark = self.pos;
            if self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
                while self
                    .peek()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_')
                {
                    self.advance();
                }
                let ident_end = self.pos;
                self.skip_whitespace();
                if self.peek() == Some('=') {
                    self.advance();
                    let name = self.input[mark..ident_end].to_string();
                    named.push((name, self.parse_value()?));
                } else {
                    self.pos = mark;
                    positional.push(self.parse_value()?);
                }
            } else {
                positional.push(self.parse_value()?);
            }
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some(')') => {}
                Some(c) => {
                    return Err(LegacyValueError::UnexpectedChar { ch: c, pos: self.pos })
                }
                None => return Err(LegacyValueError::UnexpectedEof),
            }
        }
    }

    fn parse_datetime_call(&mut self, date_only: bool) -> Result<Value, LegacyValueError> {
        let (positional, named) = self.parse_call_args()?;
        if !named.is_empty() {
            return Err(LegacyValueError::InvalidDateTime(
                "named arguments are not part of the legacy datetime shape".into(),
            ));
        }
        let args: Vec<i64> = positional
            .iter()
            .map(|v| {
                v.as_int().ok_or_else(|| {
                    LegacyValueError::InvalidDateTime("non-integer datetime argument".into())
                })
            })
            .collect::<Result<_, _>>()?;

        let expected = if date_only { 3..=3 } else { 3..=7 };
        if !expected.contains(&args.len()) {
            return Err(LegacyValueError::InvalidDateTime(format!(
                "expected {} arguments, got {}",
                if date_only { "3" } else { "3 to 7" },
                args.len()
            )));
        }

        let date = NaiveDate::from_ymd_opt(
            i32::try_from(args[0])
                .map_err(|_| LegacyValueError::InvalidDateTime("year out of range".into()))?,
            u32::try_from(args[1]).unwrap_or(0),
            u32::try_from(args[2]).unwrap_or(0),
        )
        .ok_or_else(|| LegacyValueError::InvalidDateTime("date out of range".into()))?;

        let get = |i: usize| args.get(i).copied().unwrap_or(0);
        let dt: NaiveDateTime = date
            .and_hms_micro_opt(
                u32::try_from(get(3)).unwrap_or(u32::MAX),
                u32::try_from(get(4)).unwrap_or(u32::MAX),
                u32::try_from(get(5)).unwrap_or(u32::MAX),
                u32::try_from(get(6)).unwrap_or(u32::MAX),
            )
            .ok_or_else(|| LegacyValueError::InvalidDateTime("time out of range".into()))?;
        Ok(Value::DateTime(dt))
    }

    /// The 9-field time-structure shim. Old writers rendered these either as
    /// a constructor over a raw sequence, over 9 positional fields, or over
    /// `tm_*` named fields; all three come back as the equivalent 9-tuple.
    fn parse_struct_time_call(&mut self) -> Result<Value, LegacyValueError> {
        const FIELDS: [&str; 9] = [
            "tm_year", "tm_mon", "tm_mday", "tm_hour", "tm_min", "tm_sec", "tm_wday",
            "tm_yday", "tm_isdst",
        ];
        let (positional, named) = self.parse_call_args()?;

        if named.is_empty() && positional.len() == 1 {
            let items = match &positional[0] {
                Value::List(items) | Value::Tuple(items) => items.clone(),
                _ => {
                    return Err(LegacyValueError::InvalidDateTime(
                        "struct_time argument is not a sequence".into(),
                    ))
                }
            };
            if items.len() != 9 {
                return Err(LegacyValueError::InvalidDateTime(format!(
                    "struct_time sequence has {} fields, expected 9",
                    items.len()
                )));
            }
            return Ok(Value::Tuple(items));
        }

        if named.is_empty() {
            if positional.len() != 9 {
                return Err(LegacyValueError::InvalidDateTime(format!(
                    "struct_time has {} positional fields, expected 9",
                    positional.len()
                )));
            }
            return Ok(Value::Tuple(positional));
        }

        if !positional.is_empty() {
            return Err(LegacyValueError::InvalidDateTime(
                "struct_time mixes positional and named fields".into(),
            ));
        }
        let mut fields = vec![Value::Int(0); 9];
        fields[8] = Value::Int(-1);
        for (name, value) in named {
            let index = FIELDS
                .iter()
                .position(|f| *f == name)
                .ok_or(LegacyValueError::DisallowedName(name))?;
            fields[index] = value;
        }
        Ok(Value::Tuple(fields))
    }
}
