//! # Message Format
//!
//! Self-describing, text-based encoding for structured messages.
//!
//! Every value is written as `<tag>:<length>:<payload>`:
//!
//! ```text
//! n:0:                      null
//! s:5:hello                 string (percent-encoded, length in characters)
//! b:4:true                  boolean
//! l:2:42                    64-bit integer
//! d:3:1.5                   64-bit float
//! m:1:s:3:keyl:1:7          message with one entry (length counts entries)
//! v:2:l:1:1l:1:2            list with two elements (length counts elements)
//! ```
//!
//! Strings are percent-encoded before their length is taken, so the `:` separator,
//! `%`, control bytes and non-ASCII bytes never appear inline. An encoded message is
//! therefore always plain ASCII.
//!
//! Decoding is strict: truncated input, unknown tags, malformed lengths, numeric
//! parse failures and trailing bytes are all reported as [`ProtocolError::DecodeError`].

use crate::error::{constants, ProtocolError, Result};
use percent_encoding::{percent_decode, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt::{self, Write as _};

/// Bytes escaped inside encoded strings (non-ASCII is always escaped)
const STRING_ESCAPES: &AsciiSet = &CONTROLS.add(b'%').add(b':');

/// Nesting limit applied while decoding untrusted input
pub const MAX_NESTING_DEPTH: usize = 128;

const TAG_NULL: u8 = b'n';
const TAG_STRING: u8 = b's';
const TAG_BOOL: u8 = b'b';
const TAG_INTEGER: u8 = b'l';
const TAG_FLOAT: u8 = b'd';
const TAG_MESSAGE: u8 = b'm';
const TAG_LIST: u8 = b'v';

const SEPARATOR: u8 = b':';

/// A single value stored in a [`Message`]
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    String(String),
    Bool(bool),
    Integer(i64),
    Float(f64),
    Message(Message),
    List(Vec<Value>),
}

impl Value {
    /// Wire tag for this value
    fn tag(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::String(_) => TAG_STRING,
            Value::Bool(_) => TAG_BOOL,
            Value::Integer(_) => TAG_INTEGER,
            Value::Float(_) => TAG_FLOAT,
            Value::Message(_) => TAG_MESSAGE,
            Value::List(_) => TAG_LIST,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats, and integers widened to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Value::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Append the wire encoding of this value to `out`
    pub fn encode_into(&self, out: &mut String) {
        let tag = self.tag();
        match self {
            Value::Null => push_scalar(out, tag, ""),
            Value::String(s) => {
                let escaped = utf8_percent_encode(s, STRING_ESCAPES).to_string();
                push_scalar(out, tag, &escaped);
            }
            Value::Bool(b) => push_scalar(out, tag, if *b { "true" } else { "false" }),
            Value::Integer(i) => push_scalar(out, tag, &i.to_string()),
            Value::Float(f) => push_scalar(out, tag, &f.to_string()),
            Value::Message(m) => m.encode_into(out),
            Value::List(items) => {
                push_header(out, tag, items.len());
                for item in items {
                    item.encode_into(out);
                }
            }
        }
    }

    fn write_pretty(&self, out: &mut String, depth: usize) {
        match self {
            Value::Null => out.push_str("null"),
            Value::String(s) => {
                let _ = write!(out, "{s:?}");
            }
            Value::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Value::Integer(i) => {
                let _ = write!(out, "{i}");
            }
            Value::Float(f) => {
                let _ = write!(out, "{f:?}");
            }
            Value::Message(m) => m.write_pretty(out, depth),
            Value::List(items) => {
                if items.is_empty() {
                    out.push_str("[]");
                    return;
                }
                out.push_str("[\n");
                for (i, item) in items.iter().enumerate() {
                    indent(out, depth + 1);
                    item.write_pretty(out, depth + 1);
                    if i + 1 < items.len() {
                        out.push(',');
                    }
                    out.push('\n');
                }
                indent(out, depth);
                out.push(']');
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v $(as $cast)?)
                }
            }
        )*
    };
}

value_from! {
    String => String,
    bool => Bool,
    i64 => Integer,
    i32 => Integer as i64,
    u32 => Integer as i64,
    f64 => Float,
    f32 => Float as f64,
    Message => Message,
    Vec<Value> => List,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Ordered mapping from unique string keys to [`Value`]s.
///
/// Entries keep insertion order; inserting an existing key replaces the value in place.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    entries: Vec<(String, Value)>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value for this key if any
    pub fn insert<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Builder-style insert
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_message(&self, key: &str) -> Option<&Message> {
        self.get(key).and_then(Value::as_message)
    }

    pub fn get_list(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_list)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Encode this message to its wire representation
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        self.encode_into(&mut out);
        out.into_bytes()
    }

    /// Append the wire encoding of this message to `out`
    pub fn encode_into(&self, out: &mut String) {
        push_header(out, TAG_MESSAGE, self.entries.len());
        for (key, value) in &self.entries {
            Value::String(key.clone()).encode_into(out);
            value.encode_into(out);
        }
    }

    /// Decode a message from its wire representation.
    ///
    /// The input must contain exactly one root message and nothing else.
    pub fn decode(bytes: &[u8]) -> Result<Message> {
        if !bytes.is_ascii() {
            return Err(ProtocolError::DecodeError(
                "encoded message contains non-ASCII bytes".into(),
            ));
        }

        let mut reader = Reader { input: bytes, pos: 0 };
        let root = reader.read_value(0)?;
        if reader.pos != bytes.len() {
            return Err(ProtocolError::DecodeError(
                constants::ERR_TRAILING_BYTES.into(),
            ));
        }

        match root {
            Value::Message(message) => Ok(message),
            _ => Err(ProtocolError::DecodeError(
                constants::ERR_ROOT_NOT_MESSAGE.into(),
            )),
        }
    }

    /// Human-readable rendering for diagnostics; not the wire format
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.write_pretty(&mut out, 0);
        out
    }

    fn write_pretty(&self, out: &mut String, depth: usize) {
        if self.entries.is_empty() {
            out.push_str("{}");
            return;
        }
        out.push_str("{\n");
        for (i, (key, value)) in self.entries.iter().enumerate() {
            indent(out, depth + 1);
            let _ = write!(out, "{key:?}: ");
            value.write_pretty(out, depth + 1);
            if i + 1 < self.entries.len() {
                out.push(',');
            }
            out.push('\n');
        }
        indent(out, depth);
        out.push('}');
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Message {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut message = Message::new();
        for (k, v) in iter {
            message.insert(k, v);
        }
        message
    }
}

fn push_header(out: &mut String, tag: u8, length: usize) {
    out.push(tag as char);
    out.push(SEPARATOR as char);
    let _ = write!(out, "{length}");
    out.push(SEPARATOR as char);
}

fn push_scalar(out: &mut String, tag: u8, payload: &str) {
    push_header(out, tag, payload.len());
    out.push_str(payload);
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

/// Cursor over ASCII input
struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    fn next_byte(&mut self) -> Result<u8> {
        let byte = *self
            .input
            .get(self.pos)
            .ok_or_else(|| ProtocolError::DecodeError(constants::ERR_TRUNCATED.into()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect_separator(&mut self) -> Result<()> {
        match self.next_byte()? {
            SEPARATOR => Ok(()),
            other => Err(ProtocolError::DecodeError(format!(
                "expected ':' at offset {}, found {:?}",
                self.pos - 1,
                other as char
            ))),
        }
    }

    fn read_length(&mut self) -> Result<usize> {
        let start = self.pos;
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(ProtocolError::DecodeError(format!(
                "missing length at offset {start}"
            )));
        }
        let digits = ascii(&self.input[start..self.pos]);
        let length = digits
            .parse::<usize>()
            .map_err(|e| ProtocolError::DecodeError(format!("invalid length {digits:?}: {e}")))?;
        self.expect_separator()?;
        Ok(length)
    }

    fn take(&mut self, length: usize) -> Result<&'a str> {
        if length > self.remaining() {
            return Err(ProtocolError::DecodeError(format!(
                "{}: need {length} bytes, {} available",
                constants::ERR_TRUNCATED,
                self.remaining()
            )));
        }
        let slice = &self.input[self.pos..self.pos + length];
        self.pos += length;
        Ok(ascii(slice))
    }

    fn read_value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ProtocolError::DecodeError(format!(
                "nesting deeper than {MAX_NESTING_DEPTH}"
            )));
        }

        let tag = self.next_byte()?;
        self.expect_separator()?;
        let length = self.read_length()?;

        match tag {
            TAG_NULL => {
                self.take(length)?;
                Ok(Value::Null)
            }
            TAG_STRING => {
                let raw = self.take(length)?;
                let decoded = percent_decode(raw.as_bytes())
                    .decode_utf8()
                    .map_err(|e| ProtocolError::DecodeError(format!("invalid string: {e}")))?;
                Ok(Value::String(decoded.into_owned()))
            }
            TAG_BOOL => match self.take(length)? {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(ProtocolError::DecodeError(format!(
                    "invalid boolean {other:?}"
                ))),
            },
            TAG_INTEGER => {
                let raw = self.take(length)?;
                raw.parse::<i64>()
                    .map(Value::Integer)
                    .map_err(|e| ProtocolError::DecodeError(format!("invalid integer {raw:?}: {e}")))
            }
            TAG_FLOAT => {
                let raw = self.take(length)?;
                raw.parse::<f64>()
                    .map(Value::Float)
                    .map_err(|e| ProtocolError::DecodeError(format!("invalid float {raw:?}: {e}")))
            }
            TAG_MESSAGE => {
                let mut message = Message {
                    entries: Vec::with_capacity(length.min(self.remaining() / 8)),
                };
                for _ in 0..length {
                    let key = match self.read_value(depth + 1)? {
                        Value::String(key) => key,
                        _ => {
                            return Err(ProtocolError::DecodeError(
                                constants::ERR_KEY_NOT_STRING.into(),
                            ))
                        }
                    };
                    let value = self.read_value(depth + 1)?;
                    message.insert(key, value);
                }
                Ok(Value::Message(message))
            }
            TAG_LIST => {
                let mut items = Vec::with_capacity(length.min(self.remaining() / 4));
                for _ in 0..length {
                    items.push(self.read_value(depth + 1)?);
                }
                Ok(Value::List(items))
            }
            other => Err(ProtocolError::DecodeError(format!(
                "unknown type tag {:?}",
                other as char
            ))),
        }
    }
}

/// Input has been checked to be ASCII, which is always valid UTF-8
fn ascii(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes).unwrap_or_default()
}
