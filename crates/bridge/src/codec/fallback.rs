//! Recursive-descent codec that does not depend on `serde_json`'s text format.

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};

use super::{Codec, CodecError};

/// Default limit on array/object nesting while decoding.
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Serializer/parser for a conservative JSON dialect.
///
/// Encoding escapes every code point outside printable ASCII as `\uXXXX`
/// (astral code points as surrogate pairs), so the payload survives channels
/// that mangle non-ASCII text. Decoding unescapes them again, maps the bare
/// word `undefined` to `null`, and rejects any other unquoted word.
#[derive(Debug, Clone, Copy)]
pub struct FallbackCodec {
    max_depth: usize,
}

impl FallbackCodec {
    /// Creates a codec with a custom nesting limit.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl Default for FallbackCodec {
    fn default() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }
}

impl Codec for FallbackCodec {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        let mut out = String::new();
        write_value(&mut out, value);
        Ok(out)
    }

    fn decode(&self, text: &str) -> Result<Value, CodecError> {
        Parser::new(text, self.max_depth).parse_document()
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, item);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            ' '..='~' => out.push(ch),
            _ => {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
        }
    }
    out.push('"');
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str, max_depth: usize) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
            depth: 0,
            max_depth,
        }
    }

    fn parse_document(mut self) -> Result<Value, CodecError> {
        let value = self.parse_value()?;
        self.skip_whitespace();
        if self.pos < self.bytes.len() {
            return Err(CodecError::TrailingCharacters { offset: self.pos });
        }
        Ok(value)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn unexpected(&self) -> CodecError {
        match self.text[self.pos..].chars().next() {
            Some(found) => CodecError::UnexpectedCharacter {
                found,
                offset: self.pos,
            },
            None => CodecError::UnexpectedEnd,
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), CodecError> {
        self.skip_whitespace();
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn parse_value(&mut self) -> Result<Value, CodecError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(CodecError::UnexpectedEnd),
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => self.parse_string().map(Value::String),
            Some(b'-' | b'0'..=b'9') => self.parse_number(),
            Some(b) if b.is_ascii_alphabetic() || b == b'_' || b == b'$' => self.parse_word(),
            Some(_) => Err(self.unexpected()),
        }
    }

    fn enter(&mut self) -> Result<(), CodecError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(CodecError::TooDeep {
                max: self.max_depth,
            });
        }
        Ok(())
    }

    fn parse_object(&mut self) -> Result<Value, CodecError> {
        self.enter()?;
        self.pos += 1;
        let mut map = Map::new();
        self.skip_whitespace();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            self.depth -= 1;
            return Ok(Value::Object(map));
        }
        loop {
            self.skip_whitespace();
            if self.peek() != Some(b'"') {
                return Err(self.unquoted_or_unexpected());
            }
            let key = self.parse_string()?;
            self.expect(b':')?;
            let value = self.parse_value()?;
            map.insert(key, value);
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.unexpected()),
            }
        }
        self.depth -= 1;
        Ok(Value::Object(map))
    }

    fn parse_array(&mut self) -> Result<Value, CodecError> {
        self.enter()?;
        self.pos += 1;
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(b']') {
            self.pos += 1;
            self.depth -= 1;
            return Ok(Value::Array(items));
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.unexpected()),
            }
        }
        self.depth -= 1;
        Ok(Value::Array(items))
    }

    /// Object keys must be quoted; report a bare key as unquoted text.
    fn unquoted_or_unexpected(&mut self) -> CodecError {
        let start = self.pos;
        let word_len = self.bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_' || **b == b'$')
            .count();
        if word_len == 0 {
            return self.unexpected();
        }
        CodecError::UnquotedText {
            text: self.text[start..start + word_len].to_string(),
            offset: start,
        }
    }

    fn parse_word(&mut self) -> Result<Value, CodecError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'$') {
            self.pos += 1;
        }
        match &self.text[start..self.pos] {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" | "undefined" => Ok(Value::Null),
            word => Err(CodecError::UnquotedText {
                text: word.to_string(),
                offset: start,
            }),
        }
    }

    fn parse_string(&mut self) -> Result<String, CodecError> {
        // Opening quote.
        self.pos += 1;
        let mut out = String::new();
        let mut run_start = self.pos;
        loop {
            match self.peek() {
                None => return Err(CodecError::UnexpectedEnd),
                Some(b'"') => {
                    out.push_str(&self.text[run_start..self.pos]);
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    out.push_str(&self.text[run_start..self.pos]);
                    let escape_at = self.pos;
                    self.pos += 1;
                    out.push(self.parse_escape(escape_at)?);
                    run_start = self.pos;
                }
                Some(b) if b < 0x20 => return Err(self.unexpected()),
                Some(_) => self.pos += 1,
            }
        }
    }

    fn parse_escape(&mut self, escape_at: usize) -> Result<char, CodecError> {
        let invalid = CodecError::InvalidEscape { offset: escape_at };
        let byte = self.peek().ok_or(CodecError::UnexpectedEnd)?;
        self.pos += 1;
        let ch = match byte {
            b'"' => '"',
            b'\\' => '\\',
            b'/' => '/',
            b'b' => '\u{8}',
            b'f' => '\u{c}',
            b'n' => '\n',
            b'r' => '\r',
            b't' => '\t',
            b'u' => {
                let unit = self.parse_hex4().ok_or(CodecError::InvalidEscape { offset: escape_at })?;
                match unit {
                    0xD800..=0xDBFF => {
                        if self.bytes.get(self.pos..self.pos + 2) != Some(b"\\u") {
                            return Err(invalid);
                        }
                        self.pos += 2;
                        let low = self.parse_hex4().ok_or(CodecError::InvalidEscape { offset: escape_at })?;
                        if !(0xDC00..=0xDFFF).contains(&low) {
                            return Err(invalid);
                        }
                        let code = 0x10000 + ((u32::from(unit) - 0xD800) << 10) + (u32::from(low) - 0xDC00);
                        char::from_u32(code).ok_or(invalid)?
                    }
                    0xDC00..=0xDFFF => return Err(invalid),
                    _ => char::from_u32(u32::from(unit)).ok_or(invalid)?,
                }
            }
            _ => return Err(invalid),
        };
        Ok(ch)
    }

    fn parse_hex4(&mut self) -> Option<u16> {
        let digits = self.text.get(self.pos..self.pos + 4)?;
        let unit = u16::from_str_radix(digits, 16).ok()?;
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        self.pos += 4;
        Some(unit)
    }

    fn parse_number(&mut self) -> Result<Value, CodecError> {
        let start = self.pos;
        let mut fractional = false;

        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        match self.peek() {
            Some(b'0') => self.pos += 1,
            Some(b'1'..=b'9') => self.skip_digits(),
            _ => return Err(self.invalid_number(start)),
        }
        if self.peek() == Some(b'.') {
            fractional = true;
            self.pos += 1;
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self.invalid_number(start));
            }
            self.skip_digits();
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            fractional = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self.invalid_number(start));
            }
            self.skip_digits();
        }

        let text = &self.text[start..self.pos];
        if !fractional {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Value::Number(Number::from(n)));
            }
            if let Ok(n) = text.parse::<u64>() {
                return Ok(Value::Number(Number::from(n)));
            }
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| self.invalid_number(start))
    }

    fn skip_digits(&mut self) {
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
    }

    fn invalid_number(&self, start: usize) -> CodecError {
        let end = self.pos.max(start + 1).min(self.text.len());
        CodecError::InvalidNumber {
            text: self.text.get(start..end).unwrap_or_default().to_string(),
            offset: start,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn codec() -> FallbackCodec {
        FallbackCodec::default()
    }

    #[test]
    fn test_encode_escapes_unicode() {
        let encoded = codec().encode(&json!("ü€😀")).expect("encode");
        assert_eq!(encoded, "\"\\u00fc\\u20ac\\ud83d\\ude00\"");
    }

    #[test]
    fn test_decode_unescapes_unicode() {
        let decoded = codec().decode("\"\\u00FC and \\ud83d\\ude00\"").expect("decode");
        assert_eq!(decoded, json!("ü and 😀"));
    }

    #[test]
    fn test_round_trip_nested_values() {
        let values = [
            json!(null),
            json!(true),
            json!(-17),
            json!(18446744073709551615u64),
            json!(2.5e-8),
            json!("tab\tquote\"back\\slash\u{1}"),
            json!([[], {}, [1, [2, [3]]]]),
            json!({"a": {"b": [1, "two", {"c": null}]}, "ключ": "значение"}),
        ];
        for value in values {
            let encoded = codec().encode(&value).expect("encode");
            assert_eq!(codec().decode(&encoded).expect("decode"), value, "{encoded}");
            let again = codec().encode(&codec().decode(&encoded).expect("decode")).expect("encode");
            assert_eq!(again, encoded);
        }
    }

    #[test]
    fn test_undefined_decodes_as_null() {
        assert_eq!(codec().decode("[undefined, null]").expect("decode"), json!([null, null]));
    }

    #[test]
    fn test_rejects_unquoted_text() {
        match codec().decode("[1, system]") {
            Err(CodecError::UnquotedText { text, offset }) => {
                assert_eq!(text, "system");
                assert_eq!(offset, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            codec().decode("{key: 1}"),
            Err(CodecError::UnquotedText { .. })
        ));
        assert!(matches!(
            codec().decode("trueish"),
            Err(CodecError::UnquotedText { .. })
        ));
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(matches!(codec().decode(""), Err(CodecError::UnexpectedEnd)));
        assert!(matches!(codec().decode("[1,"), Err(CodecError::UnexpectedEnd)));
        assert!(matches!(codec().decode("[1] 2"), Err(CodecError::TrailingCharacters { .. })));
        assert!(matches!(codec().decode("01"), Err(CodecError::TrailingCharacters { .. })));
        assert!(matches!(codec().decode("-"), Err(CodecError::InvalidNumber { .. })));
        assert!(matches!(codec().decode("1.e5"), Err(CodecError::InvalidNumber { .. })));
        assert!(matches!(codec().decode("\"\\x\""), Err(CodecError::InvalidEscape { .. })));
        assert!(matches!(codec().decode("\"\\udc00\""), Err(CodecError::InvalidEscape { .. })));
        assert!(matches!(codec().decode("[1 2]"), Err(CodecError::UnexpectedCharacter { .. })));
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}{}", "[".repeat(5), "]".repeat(5));
        assert!(FallbackCodec::with_max_depth(5).decode(&deep).is_ok());
        assert!(matches!(
            FallbackCodec::with_max_depth(4).decode(&deep),
            Err(CodecError::TooDeep { max: 4 })
        ));
    }
}
