//! Streaming IMAP command tokenizer
//!
//! Commands arrive as raw bytes that may be split across any number of
//! network reads. [`Receiver::parse`] consumes whatever bytes are available and
//! either yields a complete [`Request`] or reports why it stopped:
//!
//! - [`ReceiverError::NeedsMoreData`]: input exhausted mid-command
//! - [`ReceiverError::NeedsLiteral`]: a synchronizing literal `{N}` was
//!   announced, the caller must send a `+` continuation before the client
//!   transmits the literal bytes
//! - [`ReceiverError::Malformed`]: grammar violation, the rest of the line is
//!   skipped
//!
//! Literal content is counted, never scanned, so it may contain CR, LF,
//! quotes or parentheses.

use crate::imap::token::Token;

/// Maximum length of a tag
const MAX_TAG_LENGTH: usize = 128;

/// Maximum length of a command verb
const MAX_VERB_LENGTH: usize = 32;

/// Maximum length of an atom or quoted string
const MAX_ARGUMENT_LENGTH: usize = 8 * 1024;

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub tag: String,
    /// Upper-cased command name
    pub verb: String,
    /// Set when the verb was prefixed with `UID`
    pub uid: bool,
    pub args: Vec<Token>,
}

/// Unit produced by the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Command(Command),
    /// Raw client line sent in answer to a server continuation (SASL)
    ContinuationLine(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverError {
    NeedsMoreData,
    NeedsLiteral { size: usize },
    Malformed { tag: Option<String>, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Tag,
    Verb,
    Argument,
    Quoted { escaped: bool },
    LiteralSize { non_sync: bool },
    LiteralSeek { size: usize, non_sync: bool },
    LiteralData { remaining: usize },
    ContinuationLine,
    Discard,
}

pub struct Receiver {
    state: State,
    buf: Vec<u8>,
    tag: String,
    verb: String,
    uid: bool,
    args: Vec<Token>,
    max_literal_size: usize,
}

impl Receiver {
    pub fn new(max_literal_size: usize) -> Self {
        Self {
            state: State::Start,
            buf: Vec::with_capacity(64),
            tag: String::new(),
            verb: String::new(),
            uid: false,
            args: Vec::new(),
            max_literal_size,
        }
    }

    /// Treat the next line as a raw continuation answer instead of a command
    pub fn expect_continuation_line(&mut self) {
        self.reset();
        self.state = State::ContinuationLine;
    }

    /// Whether a partially received command is buffered
    pub fn is_idle(&self) -> bool {
        self.state == State::Start
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.tag.clear();
        self.verb.clear();
        self.uid = false;
        self.args.clear();
    }

    /// Abort the current command; the remainder of the line is discarded
    /// unless the error was raised on the line terminator itself.
    fn fail(&mut self, message: impl Into<String>, at_line_end: bool) -> ReceiverError {
        let tag = if self.tag.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.tag))
        };
        self.reset();
        self.state = if at_line_end { State::Start } else { State::Discard };
        ReceiverError::Malformed {
            tag,
            message: message.into(),
        }
    }

    fn complete(&mut self) -> Request {
        self.state = State::Start;
        self.buf.clear();
        Request::Command(Command {
            tag: std::mem::take(&mut self.tag),
            verb: std::mem::take(&mut self.verb),
            uid: std::mem::replace(&mut self.uid, false),
            args: std::mem::take(&mut self.args),
        })
    }

    /// Close the pending atom. `at_line_end` is set when the byte that ended
    /// it was the line feed, so a failure must not discard the next line.
    fn push_atom(&mut self, at_line_end: bool) -> Result<(), ReceiverError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        match String::from_utf8(std::mem::take(&mut self.buf)) {
            Ok(atom) => {
                self.args.push(Token::Atom(atom));
                Ok(())
            }
            Err(_) => Err(self.fail("Argument is not valid UTF-8", at_line_end)),
        }
    }

    /// Returns `true` when the verb was a `UID` prefix and another verb follows
    fn finish_verb(&mut self) -> Result<bool, ReceiverError> {
        let verb = String::from_utf8(std::mem::take(&mut self.buf))
            .map_err(|_| self.fail("Command is not valid UTF-8", false))?;
        if verb == "UID" && !self.uid {
            self.uid = true;
            return Ok(true);
        }
        self.verb = verb;
        Ok(false)
    }

    /// Consume bytes from `bytes` until a request is complete or input runs out.
    ///
    /// Partial state (including the number of literal bytes still owed) is kept
    /// between calls, so the same receiver must be fed every read of the
    /// connection in order.
    pub fn parse(&mut self, bytes: &mut std::slice::Iter<'_, u8>) -> Result<Request, ReceiverError> {
        loop {
            if let State::LiteralData { remaining } = self.state {
                let available = bytes.as_slice();
                if available.is_empty() {
                    return Err(ReceiverError::NeedsMoreData);
                }
                let take = remaining.min(available.len());
                self.buf.extend_from_slice(&available[..take]);
                bytes.nth(take - 1);

                if take == remaining {
                    self.args.push(Token::Literal(std::mem::take(&mut self.buf)));
                    self.state = State::Argument;
                } else {
                    self.state = State::LiteralData {
                        remaining: remaining - take,
                    };
                }
                continue;
            }

            let Some(&ch) = bytes.next() else {
                return Err(ReceiverError::NeedsMoreData);
            };

            match self.state {
                State::Start => {
                    if !ch.is_ascii_whitespace() {
                        self.buf.push(ch);
                        self.state = State::Tag;
                    }
                }
                State::Tag => match ch {
                    b' ' | b'\t' => {
                        self.tag = String::from_utf8(std::mem::take(&mut self.buf))
                            .map_err(|_| self.fail("Tag is not valid UTF-8", false))?;
                        self.state = State::Verb;
                    }
                    b'\r' => {}
                    b'\n' => {
                        let tag = String::from_utf8_lossy(&self.buf).into_owned();
                        self.tag = tag;
                        return Err(self.fail("Missing command after tag", true));
                    }
                    b'(' | b')' | b'{' | b'"' => {
                        return Err(self.fail("Invalid character in tag", false));
                    }
                    _ => {
                        if self.buf.len() >= MAX_TAG_LENGTH {
                            return Err(self.fail("Tag too long", false));
                        }
                        self.buf.push(ch);
                    }
                },
                State::Verb => match ch {
                    b' ' | b'\t' => {
                        if !self.buf.is_empty() && !self.finish_verb()? {
                            self.state = State::Argument;
                        }
                    }
                    b'\r' => {}
                    b'\n' => {
                        if self.buf.is_empty() {
                            return Err(self.fail("Missing command after tag", true));
                        }
                        self.finish_verb()?;
                        return Ok(self.complete());
                    }
                    _ if ch.is_ascii_alphanumeric() || ch == b'-' => {
                        if self.buf.len() >= MAX_VERB_LENGTH {
                            return Err(self.fail("Command too long", false));
                        }
                        self.buf.push(ch.to_ascii_uppercase());
                    }
                    _ => {
                        return Err(self.fail(
                            format!("Invalid character {:?} in command name", ch as char),
                            false,
                        ));
                    }
                },
                State::Argument => match ch {
                    b'"' => {
                        self.push_atom(false)?;
                        self.state = State::Quoted { escaped: false };
                    }
                    b'{' if self.buf.is_empty() => {
                        self.state = State::LiteralSize { non_sync: false };
                    }
                    b'(' => {
                        self.push_atom(false)?;
                        self.args.push(Token::ParenOpen);
                    }
                    b')' => {
                        self.push_atom(false)?;
                        self.args.push(Token::ParenClose);
                    }
                    b'\r' => {}
                    b'\n' => {
                        self.push_atom(true)?;
                        return Ok(self.complete());
                    }
                    b' ' | b'\t' => self.push_atom(false)?,
                    _ => {
                        if self.buf.len() >= MAX_ARGUMENT_LENGTH {
                            return Err(self.fail("Argument too long", false));
                        }
                        self.buf.push(ch);
                    }
                },
                State::Quoted { escaped } => match ch {
                    b'\n' => return Err(self.fail("Unterminated quoted string", true)),
                    b'\\' if !escaped => self.state = State::Quoted { escaped: true },
                    b'"' if !escaped => {
                        let value = String::from_utf8(std::mem::take(&mut self.buf))
                            .map_err(|_| self.fail("Quoted string is not valid UTF-8", false))?;
                        self.args.push(Token::Quoted(value));
                        self.state = State::Argument;
                    }
                    _ => {
                        if self.buf.len() >= MAX_ARGUMENT_LENGTH {
                            return Err(self.fail("Quoted string too long", false));
                        }
                        self.buf.push(ch);
                        self.state = State::Quoted { escaped: false };
                    }
                },
                State::LiteralSize { non_sync } => match ch {
                    b'0'..=b'9' if !non_sync => self.buf.push(ch),
                    b'+' if !non_sync && !self.buf.is_empty() => {
                        self.state = State::LiteralSize { non_sync: true };
                    }
                    b'}' if !self.buf.is_empty() => {
                        let size = std::str::from_utf8(&self.buf)
                            .ok()
                            .and_then(|digits| digits.parse::<usize>().ok());
                        let Some(size) = size else {
                            return Err(self.fail("Literal size is not a valid number", false));
                        };
                        if size > self.max_literal_size {
                            return Err(self.fail(
                                format!(
                                    "Literal exceeds the maximum size of {} bytes",
                                    self.max_literal_size
                                ),
                                false,
                            ));
                        }
                        self.buf.clear();
                        self.state = State::LiteralSeek { size, non_sync };
                    }
                    b'\n' => return Err(self.fail("Unterminated literal size", true)),
                    _ => {
                        return Err(self.fail(
                            format!("Invalid character {:?} in literal size", ch as char),
                            false,
                        ));
                    }
                },
                State::LiteralSeek { size, non_sync } => match ch {
                    b'\r' => {}
                    b'\n' => {
                        if size == 0 {
                            self.args.push(Token::Literal(Vec::new()));
                            self.state = State::Argument;
                        } else {
                            self.buf.reserve(size);
                            self.state = State::LiteralData { remaining: size };
                        }
                        if !non_sync {
                            return Err(ReceiverError::NeedsLiteral { size });
                        }
                    }
                    _ => {
                        return Err(self.fail("Expected CRLF after literal size", false));
                    }
                },
                State::ContinuationLine => match ch {
                    b'\r' => {}
                    b'\n' => {
                        let line = String::from_utf8_lossy(&self.buf).into_owned();
                        self.buf.clear();
                        self.state = State::Start;
                        return Ok(Request::ContinuationLine(line));
                    }
                    _ => {
                        if self.buf.len() >= MAX_ARGUMENT_LENGTH {
                            return Err(self.fail("Continuation line too long", false));
                        }
                        self.buf.push(ch);
                    }
                },
                State::Discard => {
                    if ch == b'\n' {
                        self.state = State::Start;
                    }
                }
                State::LiteralData { .. } => {
                    unreachable!("literal bytes are consumed before the byte match")
                }
            }
        }
    }
}
