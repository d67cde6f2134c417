// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Parser for `key=value,key=value` option strings.
//!
//! Options must be registered with [`OptionParser::add`] before parsing;
//! anything not registered is rejected. Values may be quoted with `"` to
//! protect embedded commas, and `""` inside a quoted value yields a literal
//! quote.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

mod private_trait {
    // Dispatches to `FromStr::from_str` on externally-defined types and to
    // custom parsing code for types in this module.
    pub trait Parseable
    where
        Self: Sized,
    {
        type Err;
        // Input is guaranteed to have balanced quotes since split_commas
        // rejects anything else.
        fn from_str(input: &str) -> Result<Self, <Self as Parseable>::Err>;
    }
}
use private_trait::Parseable;

#[derive(Default)]
pub struct OptionParser {
    options: HashMap<String, Option<String>>,
}

#[derive(Error, Debug)]
pub enum OptionParserError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* field */, String /* value */),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
type OptionParserResult<T> = std::result::Result<T, OptionParserError>;

fn split_commas(s: &str) -> OptionParserResult<Vec<String>> {
    let mut list: Vec<String> = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();

    for c in s.trim().chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                list.push(current);
                current = String::new();
                continue;
            }
            _ => {}
        };
        current.push(c);
    }
    list.push(current);

    if in_quotes {
        return Err(OptionParserError::InvalidSyntax(s.to_owned()));
    }

    Ok(list)
}

impl OptionParser {
    pub fn new() -> Self {
        Self {
            options: HashMap::new(),
        }
    }

    /// Parse `input`, recording the value of every registered option it
    /// names. Later occurrences of an option override earlier ones.
    pub fn parse(&mut self, input: &str) -> OptionParserResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in split_commas(input)?.iter() {
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value)),
                None => (option.trim(), None),
            };
            let entry = self
                .options
                .get_mut(name)
                .ok_or_else(|| OptionParserError::UnknownOption(name.to_owned()))?;
            let value = value.ok_or_else(|| OptionParserError::InvalidSyntax(option.to_owned()))?;
            *entry = Some(value.trim().to_owned());
        }

        Ok(())
    }

    /// Register an option that takes a value.
    pub fn add(&mut self, option: &str) -> &mut Self {
        assert!(
            !option.contains(['"', '=', ',']),
            "forbidden character in option name"
        );
        self.options.insert(option.to_owned(), None);

        self
    }

    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .and_then(|v| v.as_deref())
            .filter(|s| !s.is_empty())
            .map(dequote)
    }

    pub fn convert<T: Parseable>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.options.get(option).and_then(|v| v.as_ref()) {
            None => Ok(None),
            Some(v) if v.is_empty() => Ok(None),
            Some(v) => Parseable::from_str(v)
                .map(Some)
                .map_err(|_| OptionParserError::Conversion(option.to_owned(), v.to_owned())),
        }
    }
}

/// Boolean option accepting `on`/`off` and `true`/`false`.
pub struct Toggle(pub bool);

#[derive(Error, Debug)]
pub enum ToggleParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl Parseable for Toggle {
    type Err = ToggleParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" => Ok(Toggle(false)),
            "on" => Ok(Toggle(true)),
            "off" => Ok(Toggle(false)),
            "true" => Ok(Toggle(true)),
            "false" => Ok(Toggle(false)),
            _ => Err(ToggleParseError::InvalidValue(s.to_owned())),
        }
    }
}

/// Byte count with an optional binary `K`, `M`, `G` or `T` suffix.
pub struct ByteSized(pub u64);

#[derive(Error, Debug)]
pub enum ByteSizedParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("value out of range: {0}")]
    Overflow(String),
}

impl FromStr for ByteSized {
    type Err = ByteSizedParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, shift) = match s.char_indices().last() {
            Some((idx, 'K')) => (&s[..idx], 10),
            Some((idx, 'M')) => (&s[..idx], 20),
            Some((idx, 'G')) => (&s[..idx], 30),
            Some((idx, 'T')) => (&s[..idx], 40),
            _ => (s, 0),
        };

        let value = digits
            .parse::<u64>()
            .map_err(|_| ByteSizedParseError::InvalidValue(s.to_owned()))?;
        value
            .checked_mul(1u64 << shift)
            .map(ByteSized)
            .ok_or_else(|| ByteSizedParseError::Overflow(s.to_owned()))
    }
}

fn dequote(s: &str) -> String {
    let mut prev_byte = b'\0';
    let mut in_quotes = false;
    let mut out: Vec<u8> = vec![];
    for i in s.bytes() {
        if i == b'"' {
            if prev_byte == b'"' && !in_quotes {
                out.push(b'"');
            }
            in_quotes = !in_quotes;
        } else {
            out.push(i);
        }
        prev_byte = i
    }
    assert!(!in_quotes, "split_commas didn't reject unbalanced quotes");
    // SAFETY: the non-ASCII bytes in the output are the same
    // and in the same order as those in the input, so if the
    // input is valid UTF-8 the output will be as well.
    unsafe { String::from_utf8_unchecked(out) }
}

impl<T> Parseable for T
where
    T: FromStr + Sized,
{
    type Err = <T as FromStr>::Err;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        dequote(s).parse()
    }
}
