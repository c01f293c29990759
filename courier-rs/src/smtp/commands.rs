use crate::error::{MailError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// Reverse path; empty for the null sender `<>`
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Starttls,
    /// Mechanism and optional initial response
    Auth(String, Option<String>),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MailError::SmtpProtocol("Empty command".to_string()));
        }

        let (verb, args) = line.split_once(' ').unwrap_or((line, ""));
        let args = args.trim();

        match verb.to_uppercase().as_str() {
            "HELO" | "EHLO" if args.is_empty() => Err(MailError::SmtpProtocol(format!(
                "{} requires domain",
                verb.to_uppercase()
            ))),
            "HELO" => Ok(SmtpCommand::Helo(args.to_string())),
            "EHLO" => Ok(SmtpCommand::Ehlo(args.to_string())),
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path(args, "FROM:")?)),
            "RCPT" => {
                let to = Self::parse_path(args, "TO:")?;
                if to.is_empty() {
                    return Err(MailError::SmtpProtocol("Empty recipient".to_string()));
                }
                Ok(SmtpCommand::RcptTo(to))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "AUTH" => {
                let mut parts = args.split_whitespace();
                let mechanism = parts
                    .next()
                    .ok_or_else(|| MailError::SmtpProtocol("AUTH requires mechanism".to_string()))?;
                let initial = parts.next().map(|s| s.to_string());
                Ok(SmtpCommand::Auth(mechanism.to_uppercase(), initial))
            }
            other => Ok(SmtpCommand::Unknown(other.to_string())),
        }
    }

    /// Parse `FROM:<addr> [params]` / `TO:<addr> [params]`, dropping ESMTP parameters
    fn parse_path(args: &str, prefix: &str) -> Result<String> {
        let matches_prefix = args
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
        if !matches_prefix {
            return Err(MailError::SmtpProtocol(format!(
                "Invalid syntax, expected {}<address>",
                prefix
            )));
        }

        let rest = args[prefix.len()..].trim_start();
        let path = match rest.strip_prefix('<') {
            Some(inner) => inner
                .split_once('>')
                .map(|(addr, _)| addr)
                .ok_or_else(|| MailError::SmtpProtocol("Unterminated path".to_string()))?,
            None => rest.split_whitespace().next().unwrap_or(""),
        };

        if path.contains(char::is_whitespace) {
            return Err(MailError::SmtpProtocol("Invalid address".to_string()));
        }
        if !path.is_empty() && !path.contains('@') && !path.eq_ignore_ascii_case("postmaster") {
            return Err(MailError::SmtpProtocol(format!("Invalid address: {}", path)));
        }
        Ok(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helo_ehlo() {
        assert_eq!(
            SmtpCommand::parse("HELO example.com").unwrap(),
            SmtpCommand::Helo("example.com".to_string())
        );
        assert_eq!(
            SmtpCommand::parse("ehlo client.example.com").unwrap(),
            SmtpCommand::Ehlo("client.example.com".to_string())
        );
        assert!(SmtpCommand::parse("EHLO").is_err());
    }

    #[test]
    fn test_parse_mail_from() {
        assert_eq!(
            SmtpCommand::parse("MAIL FROM:<sender@example.com>").unwrap(),
            SmtpCommand::MailFrom("sender@example.com".to_string())
        );
        assert_eq!(
            SmtpCommand::parse("MAIL FROM: <sender@example.com> SIZE=1024 BODY=8BITMIME").unwrap(),
            SmtpCommand::MailFrom("sender@example.com".to_string())
        );
        assert_eq!(
            SmtpCommand::parse("MAIL FROM:<>").unwrap(),
            SmtpCommand::MailFrom(String::new())
        );
        assert!(SmtpCommand::parse("MAIL <sender@example.com>").is_err());
        assert!(SmtpCommand::parse("MAIL FROM:<not-an-address>").is_err());
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            SmtpCommand::parse("RCPT TO:<recipient@example.com>").unwrap(),
            SmtpCommand::RcptTo("recipient@example.com".to_string())
        );
        assert!(SmtpCommand::parse("RCPT TO:<>").is_err());
        assert!(SmtpCommand::parse("RCPT TO:<recipient@example.com").is_err());
    }

    #[test]
    fn test_parse_auth() {
        assert_eq!(
            SmtpCommand::parse("AUTH plain AHVzZXIAcGFzcw==").unwrap(),
            SmtpCommand::Auth("PLAIN".to_string(), Some("AHVzZXIAcGFzcw==".to_string()))
        );
        assert_eq!(
            SmtpCommand::parse("AUTH LOGIN").unwrap(),
            SmtpCommand::Auth("LOGIN".to_string(), None)
        );
        assert!(SmtpCommand::parse("AUTH").is_err());
    }

    #[test]
    fn test_parse_simple_verbs() {
        assert_eq!(SmtpCommand::parse("DATA").unwrap(), SmtpCommand::Data);
        assert_eq!(SmtpCommand::parse("quit").unwrap(), SmtpCommand::Quit);
        assert_eq!(SmtpCommand::parse("StartTLS").unwrap(), SmtpCommand::Starttls);
        assert_eq!(
            SmtpCommand::parse("VRFY bob").unwrap(),
            SmtpCommand::Unknown("VRFY".to_string())
        );
        assert!(SmtpCommand::parse("   ").is_err());
    }
}
