use crate::error::{MailError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// Reverse path (empty for the null sender `<>`) and declared SIZE
    MailFrom {
        address: String,
        size: Option<usize>,
    },
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MailError::SmtpProtocol("Empty command".to_string()));
        }

        let (command, args) = match line.split_once(' ') {
            Some((command, args)) => (command.to_uppercase(), args.trim()),
            None => (line.to_uppercase(), ""),
        };

        match command.as_str() {
            "HELO" | "EHLO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol(format!("{} requires domain", command)));
                }
                let domain = args.to_string();
                Ok(if command == "HELO" {
                    SmtpCommand::Helo(domain)
                } else {
                    SmtpCommand::Ehlo(domain)
                })
            }
            "MAIL" => {
                let (address, params) = Self::parse_path(args, "FROM:")?;
                let size = Self::parse_size(params)?;
                Ok(SmtpCommand::MailFrom { address, size })
            }
            "RCPT" => {
                let (address, _) = Self::parse_path(args, "TO:")?;
                if address.is_empty() {
                    return Err(MailError::SmtpProtocol("Empty recipient".to_string()));
                }
                Ok(SmtpCommand::RcptTo(address))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// `FROM:<addr> PARAM=...` -> (addr, params)
    fn parse_path<'a>(args: &'a str, keyword: &str) -> Result<(String, &'a str)> {
        if args.len() < keyword.len() || !args[..keyword.len()].eq_ignore_ascii_case(keyword) {
            return Err(MailError::SmtpProtocol(format!(
                "Invalid syntax, expected {}<address>",
                keyword
            )));
        }

        let rest = args[keyword.len()..].trim_start();
        if let Some(inner) = rest.strip_prefix('<') {
            let Some(end) = inner.find('>') else {
                return Err(MailError::SmtpProtocol("Unterminated address".to_string()));
            };
            return Ok((inner[..end].trim().to_string(), inner[end + 1..].trim()));
        }

        // Bare address without angle brackets
        match rest.split_once(' ') {
            Some((address, params)) => Ok((address.to_string(), params.trim())),
            None => Ok((rest.to_string(), "")),
        }
    }

    fn parse_size(params: &str) -> Result<Option<usize>> {
        for param in params.split_whitespace() {
            if let Some((key, value)) = param.split_once('=') {
                if key.eq_ignore_ascii_case("SIZE") {
                    let size = value
                        .parse()
                        .map_err(|_| MailError::SmtpProtocol(format!("Invalid SIZE {}", value)))?;
                    return Ok(Some(size));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helo() {
        let cmd = SmtpCommand::parse("HELO example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Helo("example.com".to_string()));
    }

    #[test]
    fn test_parse_ehlo_requires_domain() {
        assert_eq!(
            SmtpCommand::parse("ehlo example.com").unwrap(),
            SmtpCommand::Ehlo("example.com".to_string())
        );
        assert!(SmtpCommand::parse("EHLO").is_err());
    }

    #[test]
    fn test_parse_mail_from() {
        let cmd = SmtpCommand::parse("MAIL FROM:<sender@example.com>").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::MailFrom {
                address: "sender@example.com".to_string(),
                size: None
            }
        );
    }

    #[test]
    fn test_parse_mail_from_with_params() {
        let cmd = SmtpCommand::parse("mail from: <a@example.com> SIZE=2048 BODY=8BITMIME").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::MailFrom {
                address: "a@example.com".to_string(),
                size: Some(2048)
            }
        );
        assert!(SmtpCommand::parse("MAIL FROM:<a@example.com> SIZE=big").is_err());
    }

    #[test]
    fn test_parse_null_sender() {
        let cmd = SmtpCommand::parse("MAIL FROM:<>").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::MailFrom {
                address: String::new(),
                size: None
            }
        );
    }

    #[test]
    fn test_parse_rcpt_to() {
        let cmd = SmtpCommand::parse("RCPT TO:<recipient@example.com>").unwrap();
        assert_eq!(cmd, SmtpCommand::RcptTo("recipient@example.com".to_string()));
        assert!(SmtpCommand::parse("RCPT TO:<>").is_err());
        assert!(SmtpCommand::parse("RCPT FROM:<x@example.com>").is_err());
    }

    #[test]
    fn test_parse_simple_verbs() {
        assert_eq!(SmtpCommand::parse("DATA").unwrap(), SmtpCommand::Data);
        assert_eq!(SmtpCommand::parse("rset").unwrap(), SmtpCommand::Rset);
        assert_eq!(SmtpCommand::parse("QUIT").unwrap(), SmtpCommand::Quit);
        assert_eq!(SmtpCommand::parse("NOOP").unwrap(), SmtpCommand::Noop);
        assert_eq!(
            SmtpCommand::parse("VRFY bob").unwrap(),
            SmtpCommand::Unknown("VRFY".to_string())
        );
        assert!(SmtpCommand::parse("   ").is_err());
    }
}
