//! IMAP response serialization

use std::fmt;

/// Completion status of a tagged response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        })
    }
}

/// Bytes queued for one command: untagged data followed by at most one
/// tagged completion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Response {
    buf: Vec<u8>,
    status: Option<Status>,
    /// Set when the session waits for a continuation line
    continuation: bool,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// `* {line}`
    pub fn untagged(&mut self, line: impl AsRef<str>) -> &mut Self {
        self.buf.extend_from_slice(b"* ");
        self.buf.extend_from_slice(line.as_ref().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    /// Append raw bytes without any framing
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// `{N}\r\n` followed by the bytes themselves
    pub fn literal(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf
            .extend_from_slice(format!("{{{}}}\r\n", bytes.len()).as_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    /// `+ {text}`, asking the client for more input
    pub fn continuation(&mut self, text: &str) -> &mut Self {
        self.buf.extend_from_slice(b"+ ");
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.continuation = true;
        self
    }

    /// Tagged completion. Line breaks in `text` become spaces so the
    /// completion stays a single line.
    pub fn tagged(&mut self, tag: &str, status: Status, text: impl AsRef<str>) -> &mut Self {
        let text = text.as_ref().replace(['\r', '\n'], " ");
        self.buf
            .extend_from_slice(format!("{} {} {}\r\n", tag, status, text).as_bytes());
        self.status = Some(status);
        self
    }

    pub fn ok(&mut self, tag: &str, text: impl AsRef<str>) -> &mut Self {
        self.tagged(tag, Status::Ok, text)
    }

    pub fn no(&mut self, tag: &str, text: impl AsRef<str>) -> &mut Self {
        self.tagged(tag, Status::No, text)
    }

    pub fn bad(&mut self, tag: &str, text: impl AsRef<str>) -> &mut Self {
        self.tagged(tag, Status::Bad, text)
    }

    /// Status of the tagged completion, if one was written
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn is_continuation(&self) -> bool {
        self.continuation
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.buf))
    }
}

/// Parenthesized, space-separated list such as `(\Seen \Flagged)`
pub fn paren_list<S: AsRef<str>>(items: &[S]) -> String {
    let joined = items
        .iter()
        .map(|item| item.as_ref())
        .collect::<Vec<_>>()
        .join(" ");
    format!("({})", joined)
}
