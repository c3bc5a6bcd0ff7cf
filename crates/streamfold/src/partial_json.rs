//! Incremental JSON tokenizer that can describe a half-received document.
//!
//! Input is fed as text fragments of any size. Finished top-level documents
//! are handed back from [`PartialJsonParser::feed`]; the document still in
//! progress can be viewed at any time with [`PartialJsonParser::snapshot`].
//! A snapshot only contains members whose key is complete; numbers and
//! `true`/`false`/`null` only show up once their token is terminated.

use serde_json::{Map, Value};

/// Malformed JSON at a character offset of the session's input.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid JSON at offset {offset}: {message}")]
pub(crate) struct SyntaxError {
    pub offset: usize,
    pub path: String,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ObjectState {
    KeyOrEnd,
    Key,
    Colon,
    Value,
    CommaOrEnd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArrayState {
    ValueOrEnd,
    Value,
    CommaOrEnd,
}

#[derive(Debug)]
enum Frame {
    Object {
        map: Map<String, Value>,
        key: Option<String>,
        state: ObjectState,
    },
    Array {
        items: Vec<Value>,
        state: ArrayState,
    },
}

#[derive(Debug)]
enum Escape {
    None,
    Backslash,
    Unicode(String),
}

#[derive(Debug)]
enum Lex {
    Idle,
    String {
        buf: String,
        escape: Escape,
        high_surrogate: Option<u16>,
        is_key: bool,
    },
    Literal(String),
}

#[derive(Debug)]
pub(crate) struct PartialJsonParser {
    stack: Vec<Frame>,
    lex: Lex,
    offset: usize,
    emit_partial_strings: bool,
    max_depth: usize,
}

impl PartialJsonParser {
    pub fn new(emit_partial_strings: bool) -> Self {
        Self {
            stack: Vec::new(),
            lex: Lex::Idle,
            offset: 0,
            emit_partial_strings,
            max_depth: usize::MAX,
        }
    }

    /// Rejects arrays and objects nested deeper than `depth`.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// True when no document is in progress.
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty() && matches!(self.lex, Lex::Idle)
    }

    /// Consumes a text fragment and returns every top-level document it
    /// completed, in order.
    pub fn feed(&mut self, text: &str) -> Result<Vec<Value>, SyntaxError> {
        let mut documents = Vec::new();
        for c in text.chars() {
            self.step(c, &mut documents)?;
            self.offset += 1;
        }
        Ok(documents)
    }

    /// Signals end of input. A bare top-level number or literal is only
    /// terminated here, so it is returned as a finished document.
    pub fn finish(&mut self) -> Result<Option<Value>, SyntaxError> {
        if self.stack.is_empty() && matches!(self.lex, Lex::Literal(_)) {
            let mut documents = Vec::new();
            self.end_literal(&mut documents)?;
            return Ok(documents.pop());
        }
        Ok(None)
    }

    /// Best-effort view of the document in progress.
    pub fn snapshot(&self) -> Option<Value> {
        let mut pending = match &self.lex {
            Lex::String {
                buf, is_key: false, ..
            } if self.emit_partial_strings => Some(Value::String(buf.clone())),
            _ => None,
        };
        for frame in self.stack.iter().rev() {
            let value = match frame {
                Frame::Object { map, key, .. } => {
                    let mut map = map.clone();
                    if let (Some(key), Some(child)) = (key, pending.take()) {
                        map.insert(key.clone(), child);
                    }
                    Value::Object(map)
                }
                Frame::Array { items, .. } => {
                    let mut items = items.clone();
                    if let Some(child) = pending.take() {
                        items.push(child);
                    }
                    Value::Array(items)
                }
            };
            pending = Some(value);
        }
        pending
    }

    /// JSON path of the innermost open container, for error messages.
    pub fn path(&self) -> String {
        let mut path = String::from("$");
        for frame in &self.stack {
            match frame {
                Frame::Object { key: Some(key), .. } => {
                    path.push('.');
                    path.push_str(key);
                }
                Frame::Object { key: None, .. } => {}
                Frame::Array { items, .. } => path.push_str(&format!("[{}]", items.len())),
            }
        }
        path
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            offset: self.offset,
            path: self.path(),
            message: message.into(),
        }
    }

    fn step(&mut self, c: char, documents: &mut Vec<Value>) -> Result<(), SyntaxError> {
        match &mut self.lex {
            Lex::String { .. } => return self.string_char(c, documents),
            Lex::Literal(buf) => {
                if is_literal_char(c) {
                    buf.push(c);
                    return Ok(());
                }
                self.end_literal(documents)?;
            }
            Lex::Idle => {}
        }
        self.structural(c, documents)
    }

    fn structural(&mut self, c: char, documents: &mut Vec<Value>) -> Result<(), SyntaxError> {
        if c.is_whitespace() {
            return Ok(());
        }
        match self.stack.last_mut() {
            None => self.start_value(c),
            Some(Frame::Object { state, .. }) => match (*state, c) {
                (ObjectState::KeyOrEnd | ObjectState::Key, '"') => {
                    self.lex = Lex::String {
                        buf: String::new(),
                        escape: Escape::None,
                        high_surrogate: None,
                        is_key: true,
                    };
                    Ok(())
                }
                (ObjectState::KeyOrEnd | ObjectState::CommaOrEnd, '}') => {
                    self.close(documents);
                    Ok(())
                }
                (ObjectState::Colon, ':') => {
                    *state = ObjectState::Value;
                    Ok(())
                }
                (ObjectState::CommaOrEnd, ',') => {
                    *state = ObjectState::Key;
                    Ok(())
                }
                (ObjectState::Value, _) => self.start_value(c),
                (expected, _) => Err(self.error(format!(
                    "unexpected {c:?} in object, expected {}",
                    describe_object_state(expected)
                ))),
            },
            Some(Frame::Array { state, .. }) => match (*state, c) {
                (ArrayState::ValueOrEnd | ArrayState::CommaOrEnd, ']') => {
                    self.close(documents);
                    Ok(())
                }
                (ArrayState::CommaOrEnd, ',') => {
                    *state = ArrayState::Value;
                    Ok(())
                }
                (ArrayState::ValueOrEnd | ArrayState::Value, _) => self.start_value(c),
                (ArrayState::CommaOrEnd, _) => {
                    Err(self.error(format!("unexpected {c:?} in array, expected ',' or ']'")))
                }
            },
        }
    }

    fn start_value(&mut self, c: char) -> Result<(), SyntaxError> {
        if matches!(c, '{' | '[') && self.stack.len() >= self.max_depth {
            return Err(self.error(format!(
                "nesting deeper than {} levels",
                self.max_depth
            )));
        }
        match c {
            '{' => self.stack.push(Frame::Object {
                map: Map::new(),
                key: None,
                state: ObjectState::KeyOrEnd,
            }),
            '[' => self.stack.push(Frame::Array {
                items: Vec::new(),
                state: ArrayState::ValueOrEnd,
            }),
            '"' => {
                self.lex = Lex::String {
                    buf: String::new(),
                    escape: Escape::None,
                    high_surrogate: None,
                    is_key: false,
                }
            }
            '-' | '0'..='9' | 't' | 'f' | 'n' => self.lex = Lex::Literal(c.to_string()),
            _ => return Err(self.error(format!("unexpected {c:?}, expected a value"))),
        }
        Ok(())
    }

    fn string_char(&mut self, c: char, documents: &mut Vec<Value>) -> Result<(), SyntaxError> {
        let offset = self.offset;
        let Lex::String {
            buf,
            escape,
            high_surrogate,
            ..
        } = &mut self.lex
        else {
            return Ok(());
        };
        match escape {
            Escape::None => match c {
                '"' => {
                    flush_surrogate(buf, high_surrogate);
                    return self.end_string(documents);
                }
                '\\' => *escape = Escape::Backslash,
                c if (c as u32) < 0x20 => {
                    let message = format!("control character {:#04x} in string", c as u32);
                    return Err(SyntaxError {
                        offset,
                        path: self.path(),
                        message,
                    });
                }
                c => {
                    flush_surrogate(buf, high_surrogate);
                    buf.push(c);
                }
            },
            Escape::Backslash => {
                let decoded = match c {
                    '"' => '"',
                    '\\' => '\\',
                    '/' => '/',
                    'b' => '\u{8}',
                    'f' => '\u{c}',
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    'u' => {
                        *escape = Escape::Unicode(String::with_capacity(4));
                        return Ok(());
                    }
                    other => {
                        return Err(SyntaxError {
                            offset,
                            path: self.path(),
                            message: format!("invalid escape \\{other}"),
                        });
                    }
                };
                flush_surrogate(buf, high_surrogate);
                buf.push(decoded);
                *escape = Escape::None;
            }
            Escape::Unicode(digits) => {
                if !c.is_ascii_hexdigit() {
                    return Err(SyntaxError {
                        offset,
                        path: self.path(),
                        message: format!("invalid unicode escape digit {c:?}"),
                    });
                }
                digits.push(c);
                if digits.len() == 4 {
                    let unit = u16::from_str_radix(digits, 16).unwrap_or(0xFFFD);
                    push_utf16_unit(buf, high_surrogate, unit);
                    *escape = Escape::None;
                }
            }
        }
        Ok(())
    }

    fn end_string(&mut self, documents: &mut Vec<Value>) -> Result<(), SyntaxError> {
        let Lex::String { buf, is_key, .. } = std::mem::replace(&mut self.lex, Lex::Idle) else {
            return Ok(());
        };
        if !is_key {
            self.attach(Value::String(buf), documents);
            return Ok(());
        }
        let duplicate = match self.stack.last() {
            Some(Frame::Object { map, .. }) => map.contains_key(&buf),
            _ => false,
        };
        if duplicate {
            return Err(self.error(format!("duplicate key `{buf}`")));
        }
        if let Some(Frame::Object { key, state, .. }) = self.stack.last_mut() {
            *key = Some(buf);
            *state = ObjectState::Colon;
        }
        Ok(())
    }

    fn end_literal(&mut self, documents: &mut Vec<Value>) -> Result<(), SyntaxError> {
        let Lex::Literal(buf) = std::mem::replace(&mut self.lex, Lex::Idle) else {
            return Ok(());
        };
        let value = match buf.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            number => match number.parse::<serde_json::Number>() {
                Ok(n) => Value::Number(n),
                Err(_) => return Err(self.error(format!("invalid literal `{buf}`"))),
            },
        };
        self.attach(value, documents);
        Ok(())
    }

    fn close(&mut self, documents: &mut Vec<Value>) {
        let value = match self.stack.pop() {
            Some(Frame::Object { map, .. }) => Value::Object(map),
            Some(Frame::Array { items, .. }) => Value::Array(items),
            None => return,
        };
        self.attach(value, documents);
    }

    fn attach(&mut self, value: Value, documents: &mut Vec<Value>) {
        match self.stack.last_mut() {
            None => documents.push(value),
            Some(Frame::Object { map, key, state }) => {
                if let Some(key) = key.take() {
                    map.insert(key, value);
                }
                *state = ObjectState::CommaOrEnd;
            }
            Some(Frame::Array { items, state }) => {
                items.push(value);
                *state = ArrayState::CommaOrEnd;
            }
        }
    }
}

fn is_literal_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')
}

fn describe_object_state(state: ObjectState) -> &'static str {
    match state {
        ObjectState::KeyOrEnd => "a key or '}'",
        ObjectState::Key => "a key",
        ObjectState::Colon => "':'",
        ObjectState::Value => "a value",
        ObjectState::CommaOrEnd => "',' or '}'",
    }
}

fn flush_surrogate(buf: &mut String, high_surrogate: &mut Option<u16>) {
    if high_surrogate.take().is_some() {
        buf.push(char::REPLACEMENT_CHARACTER);
    }
}

fn push_utf16_unit(buf: &mut String, high_surrogate: &mut Option<u16>, unit: u16) {
    match unit {
        0xD800..=0xDBFF => {
            flush_surrogate(buf, high_surrogate);
            *high_surrogate = Some(unit);
        }
        0xDC00..=0xDFFF => match high_surrogate.take() {
            Some(high) => {
                let code = 0x10000 + ((u32::from(high) - 0xD800) << 10) + (u32::from(unit) - 0xDC00);
                buf.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            None => buf.push(char::REPLACEMENT_CHARACTER),
        },
        _ => {
            flush_surrogate(buf, high_surrogate);
            buf.push(char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER));
        }
    }
}
