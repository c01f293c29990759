//! SMTP client used by the relay forwarder
//!
//! One synchronous transaction per call: EHLO, MAIL, one RCPT per recipient,
//! DATA with dot-stuffing, QUIT. No MX lookup and no retries.

use crate::error::{MailError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// SMTP client for a fixed smart host
///
/// # Examples
/// ```no_run
/// use courier_rs::smtp::SmtpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = SmtpClient::new("relay.example.com:25");
/// client
///     .send_mail(
///         "sender@example.com",
///         &["recipient@other.com".to_string()],
///         b"Subject: Test\r\n\r\nHello!\r\n",
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SmtpClient {
    server_addr: String,
    helo_name: String,
}

impl SmtpClient {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            helo_name: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }

    /// Name sent in EHLO, the local hostname by default
    pub fn with_helo_name(mut self, helo_name: impl Into<String>) -> Self {
        self.helo_name = helo_name.into();
        self
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub async fn send_mail(&self, from: &str, recipients: &[String], data: &[u8]) -> Result<()> {
        if recipients.is_empty() {
            return Err(MailError::Delivery("No recipients".to_string()));
        }
        info!(
            "Relaying mail from {} to {} recipient(s) via {}",
            from,
            recipients.len(),
            self.server_addr
        );

        let stream = TcpStream::connect(&self.server_addr).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        read_response(&mut reader, "220").await?;

        write_line(&mut writer, &format!("EHLO {}", self.helo_name)).await?;
        read_response(&mut reader, "250").await?;

        write_line(&mut writer, &format!("MAIL FROM:<{}>", from)).await?;
        read_response(&mut reader, "250").await?;

        for recipient in recipients {
            write_line(&mut writer, &format!("RCPT TO:<{}>", recipient)).await?;
            read_response(&mut reader, "250").await?;
        }

        write_line(&mut writer, "DATA").await?;
        read_response(&mut reader, "354").await?;

        writer.write_all(&dot_stuff(data)).await?;
        writer.write_all(b".\r\n").await?;
        read_response(&mut reader, "250").await?;

        write_line(&mut writer, "QUIT").await?;
        let _ = read_response(&mut reader, "221").await;

        info!("Mail relayed via {}", self.server_addr);
        Ok(())
    }
}

/// Escape leading dots and make sure the body ends with CRLF
fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut line_start = true;
    for &byte in data {
        if line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        line_start = byte == b'\n';
    }
    if !out.is_empty() && !out.ends_with(b"\r\n") {
        if out.ends_with(b"\n") {
            out.pop();
        }
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read a possibly multi-line reply and check its code
async fn read_response<R>(reader: &mut BufReader<R>, expected: &str) -> Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut full_response = String::new();

    loop {
        let mut line = String::new();
        let n = timeout(RESPONSE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| MailError::Delivery("Timed out waiting for relay".to_string()))??;
        if n == 0 {
            return Err(MailError::Delivery("Relay closed the connection".to_string()));
        }
        debug!("< {}", line.trim_end());
        full_response.push_str(&line);

        // Last line has a space after the code
        if line.len() < 4 || line.as_bytes()[3] == b' ' {
            break;
        }
    }

    if !full_response.starts_with(expected) {
        error!("Unexpected relay response: {}", full_response.trim_end());
        return Err(MailError::Delivery(format!(
            "Expected {}, got: {}",
            expected,
            full_response.trim_end()
        )));
    }

    Ok(full_response)
}

async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!("> {}", line);
    writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(dot_stuff(b".hidden\r\nline\r\n"), b"..hidden\r\nline\r\n");
        assert_eq!(dot_stuff(b"a\r\n.\r\nb"), b"a\r\n..\r\nb\r\n");
        assert_eq!(dot_stuff(b"bare\n"), b"bare\r\n");
        assert!(dot_stuff(b"").is_empty());
    }

    #[test]
    fn test_client_creation() {
        let client = SmtpClient::new("mail.example.com:25").with_helo_name("courier.test");
        assert_eq!(client.server_addr(), "mail.example.com:25");
        assert_eq!(client.helo_name, "courier.test");
    }
}
