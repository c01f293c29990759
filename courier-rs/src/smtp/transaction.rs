//! SMTP transaction state
//!
//! Greeting -> (EHLO/HELO) -> Ready -> MAIL -> RCPT+ -> Data -> Ready.
//! The transaction never touches the network; the session feeds it commands
//! and DATA lines and writes the [`Reply`] it returns.

use std::fmt;

/// Numeric SMTP reply, possibly multi-line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn is_error(&self) -> bool {
        self.code >= 500
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        for (index, line) in self.lines.iter().enumerate() {
            let separator = if index == last { ' ' } else { '-' };
            write!(f, "{}{}{}\r\n", self.code, separator, line)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Connected, no EHLO/HELO yet
    Greeting,
    Ready,
    Mail,
    Rcpt,
    Data,
}

/// Completed message handed to delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
}

/// Why a DATA body was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataError {
    TooLarge,
    LineTooLong,
}

/// A DATA line is terminal only when it is exactly `.`
pub fn is_data_terminator(line: &[u8]) -> bool {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    line == b"."
}

#[derive(Debug)]
pub struct SmtpTransaction {
    state: TransactionState,
    helo: Option<String>,
    sender: Option<String>,
    recipients: Vec<String>,
    data: Vec<u8>,
    data_error: Option<DataError>,
    authenticated: Option<String>,
    tls_offered: bool,
    tls_upgraded: bool,
    max_recipients: usize,
    max_message_size: usize,
}

impl SmtpTransaction {
    pub fn new(max_recipients: usize, max_message_size: usize) -> Self {
        Self {
            state: TransactionState::Greeting,
            helo: None,
            sender: None,
            recipients: Vec::new(),
            data: Vec::new(),
            data_error: None,
            authenticated: None,
            tls_offered: false,
            tls_upgraded: false,
            max_recipients,
            max_message_size,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn helo(&self) -> Option<&str> {
        self.helo.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn in_data_mode(&self) -> bool {
        self.state == TransactionState::Data
    }

    pub fn authenticated(&self) -> Option<&str> {
        self.authenticated.as_deref()
    }

    pub fn set_authenticated(&mut self, username: String) {
        self.authenticated = Some(username);
    }

    pub fn tls_offered(&self) -> bool {
        self.tls_offered
    }

    pub fn set_tls_offered(&mut self, offered: bool) {
        self.tls_offered = offered;
    }

    pub fn tls_upgraded(&self) -> bool {
        self.tls_upgraded
    }

    /// Clear sender, recipients and body
    fn clear_envelope(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.data.clear();
        self.data_error = None;
    }

    /// EHLO/HELO: record the client name and start over
    pub fn greet(&mut self, domain: &str) {
        self.clear_envelope();
        self.helo = Some(domain.to_string());
        self.state = TransactionState::Ready;
    }

    pub fn rset(&mut self) -> Reply {
        self.clear_envelope();
        if self.state != TransactionState::Greeting {
            self.state = TransactionState::Ready;
        }
        Reply::new(250, "2.0.0 OK")
    }

    /// Reset after a completed TLS handshake. Everything learned over the
    /// plaintext channel is forgotten, including EHLO and AUTH.
    pub fn reset_after_starttls(&mut self) {
        self.clear_envelope();
        self.helo = None;
        self.authenticated = None;
        self.tls_offered = false;
        self.tls_upgraded = true;
        self.state = TransactionState::Ready;
    }

    pub fn mail_from(&mut self, sender: String) -> Reply {
        match self.state {
            TransactionState::Greeting => Reply::new(503, "5.5.1 Send HELO/EHLO first"),
            TransactionState::Ready => {
                self.clear_envelope();
                self.sender = Some(sender);
                self.state = TransactionState::Mail;
                Reply::new(250, "2.1.0 OK")
            }
            _ => Reply::new(503, "5.5.1 Sender already specified"),
        }
    }

    pub fn rcpt_to(&mut self, recipient: String) -> Reply {
        match self.state {
            TransactionState::Mail | TransactionState::Rcpt => {
                if self.recipients.len() >= self.max_recipients {
                    return Reply::new(
                        452,
                        format!("4.5.3 Too many recipients (max {})", self.max_recipients),
                    );
                }
                self.recipients.push(recipient);
                self.state = TransactionState::Rcpt;
                Reply::new(250, "2.1.5 OK")
            }
            _ => Reply::new(503, "5.5.1 Need MAIL command first"),
        }
    }

    pub fn start_data(&mut self) -> Reply {
        match self.state {
            TransactionState::Rcpt => {
                self.data.clear();
                self.data_error = None;
                self.state = TransactionState::Data;
                Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>")
            }
            TransactionState::Mail => Reply::new(503, "5.5.1 Need RCPT command first"),
            _ => Reply::new(503, "5.5.1 Need MAIL command first"),
        }
    }

    /// Accept one raw DATA line including its line ending. Returns `true` when
    /// the line was the terminator.
    pub fn push_data_line(&mut self, line: &[u8]) -> bool {
        if is_data_terminator(line) {
            return true;
        }
        if self.data_error.is_some() {
            return false;
        }

        // RFC 5321 4.5.2: drop the first character of any line starting with a dot
        let line = line.strip_prefix(b".").unwrap_or(line);
        if self.data.len() + line.len() > self.max_message_size {
            self.data_error = Some(DataError::TooLarge);
            self.data = Vec::new();
            return false;
        }
        self.data.extend_from_slice(line);
        false
    }

    /// Record a DATA line that exceeded the line length limit
    pub fn reject_long_line(&mut self) {
        if self.data_error.is_none() {
            self.data_error = Some(DataError::LineTooLong);
            self.data = Vec::new();
        }
    }

    /// Finish DATA. The transaction returns to Ready either way.
    pub fn take_message(&mut self) -> Result<Envelope, Reply> {
        let error = self.data_error.take();
        let envelope = Envelope {
            sender: self.sender.take().unwrap_or_default(),
            recipients: std::mem::take(&mut self.recipients),
            data: std::mem::take(&mut self.data),
        };
        self.state = TransactionState::Ready;

        match error {
            Some(DataError::TooLarge) => Err(Reply::new(
                552,
                format!(
                    "5.3.4 Message too large (max {} bytes)",
                    self.max_message_size
                ),
            )),
            Some(DataError::LineTooLong) => Err(Reply::new(500, "5.5.2 Line too long")),
            None => Ok(envelope),
        }
    }

    /// Drop any half-received message, e.g. when the connection goes away
    pub fn abort(&mut self) {
        self.clear_envelope();
        if self.state != TransactionState::Greeting {
            self.state = TransactionState::Ready;
        }
    }
}
