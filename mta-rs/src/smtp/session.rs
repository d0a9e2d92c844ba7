use crate::authentication::SpfValidator;
use crate::config::Config;
use crate::directory::AccountDirectory;
use crate::error::{MailError, Result};
use crate::mime::{ContentDecoder, MimeParser};
use crate::security::{Guard, Verdict};
use crate::smtp::commands::SmtpCommand;
use crate::smtp::queue::{OutboundJob, OutboundQueue};
use crate::storage::{generate_id, MessageStore, NewMessage};
use crate::utils::{domain_of, local_part, normalize_address, validate_email};
use ipnet::IpNet;
use mail_parser::MessageParser;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Maximum line length in SMTP protocol (RFC 5321), CRLF included
const MAX_LINE_LENGTH: usize = 1000;

/// Everything a session needs, shared by every connection
#[derive(Clone)]
pub struct SmtpContext {
    pub config: Arc<Config>,
    pub guard: Arc<Guard>,
    pub store: Arc<MessageStore>,
    pub directory: Arc<dyn AccountDirectory>,
    pub decoder: Arc<ContentDecoder>,
    /// `None` disables the advisory SPF check
    pub spf: Option<Arc<SpfValidator>>,
    /// `None` means external recipients cannot be accepted at all
    pub outbound: Option<OutboundQueue>,
}

impl SmtpContext {
    /// Peer is listed in `smtp.trusted_origins` (address or CIDR)
    pub fn is_trusted(&self, peer: &IpAddr) -> bool {
        self.config.smtp.trusted_origins.iter().any(|origin| {
            let origin = origin.trim();
            match origin.parse::<IpNet>() {
                Ok(net) => net.contains(peer),
                Err(_) => origin.parse::<IpAddr>().is_ok_and(|ip| ip == *peer),
            }
        })
    }

    fn is_local_domain(&self, domain: &str) -> bool {
        domain.eq_ignore_ascii_case(&self.config.server.domain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
    Data,
}

#[derive(Debug, Clone, PartialEq)]
enum Recipient {
    Local { address: String, username: String },
    Remote(String),
}

enum Line {
    Text(String),
    TooLong,
    Closed,
    TimedOut,
}

enum DataOutcome {
    Complete,
    TooLarge,
    LineTooLong,
}

/// One inbound SMTP conversation
///
/// # Limits
/// - Bounded line length and message size
/// - Command and DATA read timeouts
/// - Recipient cap per transaction
/// - Disconnect with 421 after `smtp.max_errors` failed commands
pub struct SmtpSession {
    ctx: Arc<SmtpContext>,
    peer: IpAddr,
    trusted: bool,
    state: SmtpState,
    helo_domain: Option<String>,
    from: Option<String>,
    recipients: Vec<Recipient>,
    data: Vec<u8>,
    error_count: usize,
}

impl SmtpSession {
    pub fn new(ctx: Arc<SmtpContext>, peer: IpAddr) -> Self {
        let trusted = ctx.is_trusted(&peer);
        Self {
            ctx,
            peer,
            trusted,
            state: SmtpState::Fresh,
            helo_domain: None,
            from: None,
            recipients: Vec::new(),
            data: Vec::new(),
            error_count: 0,
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    fn hostname(&self) -> &str {
        &self.ctx.config.server.hostname
    }

    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);

        match self.ctx.guard.admit_connection(&self.peer, self.trusted).await {
            Verdict::Allow => {}
            Verdict::Blocked => {
                stream.write_all(b"554 5.7.1 Access denied\r\n").await?;
                stream.flush().await?;
                return Ok(());
            }
            Verdict::RateLimited => {
                warn!("Connection quota exceeded for {}", self.peer);
                stream
                    .write_all(b"421 4.7.0 Too many connections, try again later\r\n")
                    .await?;
                stream.flush().await?;
                return Ok(());
            }
        }

        debug!("Session from {} (trusted: {})", self.peer, self.trusted);
        stream
            .write_all(format!("220 {} ESMTP Service Ready\r\n", self.hostname()).as_bytes())
            .await?;
        stream.flush().await?;

        self.process_commands(&mut stream).await
    }

    async fn process_commands<S>(&mut self, stream: &mut BufReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let command_timeout = self.ctx.config.smtp.command_timeout();

        loop {
            // Disconnect abusive clients
            if self.error_count >= self.ctx.config.smtp.max_errors {
                warn!("Too many errors from {}, disconnecting", self.peer);
                stream
                    .write_all(b"421 4.7.0 Too many errors, closing connection\r\n")
                    .await?;
                stream.flush().await?;
                return Ok(());
            }

            let line = match read_line(stream, command_timeout).await? {
                Line::Text(line) => line,
                Line::TooLong => {
                    error!("Command line too long from {}", self.peer);
                    self.reply(stream, "500 5.5.2 Line too long\r\n").await?;
                    continue;
                }
                Line::Closed => {
                    debug!("Client {} disconnected", self.peer);
                    return Ok(());
                }
                Line::TimedOut => {
                    warn!("Command timeout for {}, disconnecting", self.peer);
                    stream
                        .write_all(b"421 4.4.2 Timeout, closing connection\r\n")
                        .await?;
                    stream.flush().await?;
                    return Ok(());
                }
            };

            let line = line.trim_end();
            debug!("Received: {}", line);

            let response = match SmtpCommand::parse(line) {
                Ok(cmd) => self.handle_command(cmd).await,
                Err(e) => {
                    debug!("Command parse error: {}", e);
                    if line.trim().is_empty() {
                        "500 5.5.2 Syntax error, command unrecognized\r\n".to_string()
                    } else {
                        "501 5.5.4 Syntax error in parameters or arguments\r\n".to_string()
                    }
                }
            };

            self.reply(stream, &response).await?;

            if response.starts_with("221") || response.starts_with("421") {
                return Ok(());
            }

            if self.state == SmtpState::Data {
                let response = self.receive_data(stream).await?;
                self.reply(stream, &response).await?;
            }
        }
    }

    /// Write a reply; every 5xx counts against the error budget
    async fn reply<S>(&mut self, stream: &mut BufReader<S>, response: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if response.starts_with('5') {
            self.error_count += 1;
        }
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn handle_command(&mut self, cmd: SmtpCommand) -> String {
        match (self.state, cmd) {
            (_, SmtpCommand::Helo(domain)) => {
                info!("HELO from {} ({})", domain, self.peer);
                self.reset_transaction();
                let response = format!("250 {} Hello {}\r\n", self.hostname(), domain);
                self.helo_domain = Some(domain);
                self.state = SmtpState::Greeted;
                response
            }
            (_, SmtpCommand::Ehlo(domain)) => {
                info!("EHLO from {} ({})", domain, self.peer);
                self.reset_transaction();

                let mut response = format!("250-{} Hello {}\r\n", self.hostname(), domain);
                response.push_str(&format!(
                    "250-SIZE {}\r\n",
                    self.ctx.config.smtp.max_message_size
                ));
                response.push_str("250-8BITMIME\r\n");
                response.push_str("250-PIPELINING\r\n");
                response.push_str("250-ENHANCEDSTATUSCODES\r\n");
                response.push_str("250 HELP\r\n");

                self.helo_domain = Some(domain);
                self.state = SmtpState::Greeted;
                response
            }
            (SmtpState::Greeted, SmtpCommand::MailFrom { address, size }) => {
                self.mail_from(address, size).await
            }
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(to)) => {
                self.rcpt_to(&to).await
            }
            (SmtpState::RcptTo, SmtpCommand::Data) => {
                debug!("DATA command received");
                self.state = SmtpState::Data;
                "354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string()
            }
            (_, SmtpCommand::Rset) => {
                debug!("RSET command");
                self.reset_transaction();
                if self.state != SmtpState::Fresh {
                    self.state = SmtpState::Greeted;
                }
                "250 2.0.0 OK\r\n".to_string()
            }
            (_, SmtpCommand::Noop) => "250 2.0.0 OK\r\n".to_string(),
            (_, SmtpCommand::Quit) => {
                debug!("QUIT command");
                format!("221 2.0.0 {} closing connection\r\n", self.hostname())
            }
            (_, SmtpCommand::Unknown(cmd)) => {
                warn!("Unknown command: {}", cmd);
                "502 5.5.1 Command not implemented\r\n".to_string()
            }
            _ => {
                debug!("Invalid command sequence in state {:?}", self.state);
                "503 5.5.1 Bad sequence of commands\r\n".to_string()
            }
        }
    }

    async fn mail_from(&mut self, address: String, size: Option<usize>) -> String {
        let max_size = self.ctx.config.smtp.max_message_size;
        if size.is_some_and(|size| size > max_size) {
            warn!("Declared size {:?} exceeds {}", size, max_size);
            return format!("552 5.3.4 Message size exceeds fixed limit of {} bytes\r\n", max_size);
        }

        let address = normalize_address(&address);
        // `<>` (bounces) carries no sender to check
        if !address.is_empty() {
            if let Err(e) = validate_email(&address) {
                debug!("MAIL FROM rejected: {}", e);
                return "501 5.1.7 Bad sender address syntax\r\n".to_string();
            }

            if !self.trusted {
                match self.ctx.guard.admit_sender(&address).await {
                    Verdict::Allow => {}
                    Verdict::Blocked => return "554 5.7.1 Sender blocked\r\n".to_string(),
                    Verdict::RateLimited => {
                        warn!("Daily quota exceeded for {}", address);
                        return "421 4.7.0 Sender quota exceeded, try again later\r\n".to_string();
                    }
                }

                if let Some(spf) = &self.ctx.spf {
                    let result = spf.check(self.peer, &address).await;
                    info!("SPF {} for {} from {}", result, address, self.peer);
                }
            }
        }

        info!("MAIL FROM: <{}>", address);
        self.from = Some(address);
        self.recipients.clear();
        self.data.clear();
        self.state = SmtpState::MailFrom;
        "250 2.1.0 OK\r\n".to_string()
    }

    async fn rcpt_to(&mut self, to: &str) -> String {
        let address = normalize_address(to);
        if validate_email(&address).is_err() {
            return "501 5.1.3 Bad recipient address syntax\r\n".to_string();
        }

        let max_recipients = self.ctx.config.smtp.max_recipients;
        if self.recipients.len() >= max_recipients {
            warn!("Too many recipients: {}", self.recipients.len());
            return format!("452 4.5.3 Too many recipients (max {})\r\n", max_recipients);
        }

        let Some(domain) = domain_of(&address) else {
            return "501 5.1.3 Bad recipient address syntax\r\n".to_string();
        };

        let recipient = if self.ctx.is_local_domain(&domain) {
            let username = local_part(&address).to_lowercase();
            match self.ctx.directory.lookup(&username).await {
                Some(account) if account.can_receive => Recipient::Local {
                    address: address.clone(),
                    username: account.username,
                },
                _ => {
                    info!("RCPT TO <{}> rejected: no such user", address);
                    return "550 5.1.1 User not found\r\n".to_string();
                }
            }
        } else if !self.trusted {
            warn!("Relay attempt from {} to <{}> denied", self.peer, address);
            return "550 5.7.1 Relay denied\r\n".to_string();
        } else if self.ctx.outbound.is_none() {
            warn!("No outbound queue, cannot relay to <{}>", address);
            return "451 4.3.2 Relaying temporarily unavailable\r\n".to_string();
        } else {
            Recipient::Remote(address.clone())
        };

        info!("RCPT TO: <{}>", address);
        self.recipients.push(recipient);
        self.state = SmtpState::RcptTo;
        "250 2.1.5 OK\r\n".to_string()
    }

    fn reset_transaction(&mut self) {
        self.from = None;
        self.recipients.clear();
        self.data.clear();
    }

    /// Read DATA up to the terminator and return the final reply
    async fn receive_data<S>(&mut self, stream: &mut BufReader<S>) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let outcome = self.read_message(stream).await?;

        let response = match outcome {
            DataOutcome::Complete => self.accept_message().await,
            DataOutcome::TooLarge => format!(
                "552 5.3.4 Message too large (max {} bytes)\r\n",
                self.ctx.config.smtp.max_message_size
            ),
            DataOutcome::LineTooLong => "500 5.5.2 Line too long\r\n".to_string(),
        };

        // Reset state for next message
        self.reset_transaction();
        self.state = SmtpState::Greeted;
        Ok(response)
    }

    /// Dot-unstuffed message into `self.data`; always consumes through `.`
    async fn read_message<S>(&mut self, stream: &mut BufReader<S>) -> Result<DataOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let data_timeout = self.ctx.config.smtp.data_timeout();
        let max_size = self.ctx.config.smtp.max_message_size;
        let mut outcome = DataOutcome::Complete;

        loop {
            let line = match read_line(stream, data_timeout).await? {
                Line::Text(line) => line,
                Line::TooLong => {
                    outcome = DataOutcome::LineTooLong;
                    continue;
                }
                Line::Closed => {
                    return Err(MailError::SmtpProtocol(
                        "Connection closed during DATA".to_string(),
                    ));
                }
                Line::TimedOut => {
                    warn!("DATA timeout from {}", self.peer);
                    return Err(MailError::SmtpProtocol("Timeout during DATA".to_string()));
                }
            };

            if line == ".\r\n" || line == ".\n" {
                debug!("End of DATA, {} bytes", self.data.len());
                return Ok(outcome);
            }

            if !matches!(outcome, DataOutcome::Complete) {
                continue;
            }

            // Transparency: a leading dot was doubled by the client
            let line = line.strip_prefix('.').unwrap_or(&line);

            if self.data.len() + line.len() > max_size {
                warn!("Message from {} exceeds {} bytes", self.peer, max_size);
                outcome = DataOutcome::TooLarge;
                self.data.clear();
                continue;
            }
            self.data.extend_from_slice(line.as_bytes());
        }
    }

    /// Parse, decode and route an accepted message
    async fn accept_message(&mut self) -> String {
        let headers = match MimeParser::parse(&self.data) {
            Ok(mime) => mime.headers,
            Err(e) => {
                warn!("Rejecting message from {}: {}", self.peer, e);
                return "554 5.6.0 Message could not be parsed\r\n".to_string();
            }
        };

        let envelope_from = self.from.clone().unwrap_or_default();
        let (sender_address, sender_name, subject, message_id) = {
            let Some(parsed) = MessageParser::default().parse(&self.data) else {
                warn!("Unparseable message from {}", self.peer);
                return "554 5.6.0 Message could not be parsed\r\n".to_string();
            };

            let header_from = parsed.from().and_then(|list| list.first());
            let sender_address = header_from
                .and_then(|a| a.address())
                .map(normalize_address)
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| envelope_from.clone());
            let sender_name = header_from
                .and_then(|a| a.name())
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| sender_address.clone());
            let subject = parsed.subject().unwrap_or_default().to_string();
            let message_id = match parsed.message_id() {
                Some(id) if !id.trim().is_empty() => format!("<{}>", id.trim()),
                _ => format!("<{}@{}>", generate_id(), self.hostname()),
            };

            (sender_address, sender_name, subject, message_id)
        };

        let from_id = match domain_of(&sender_address) {
            Some(domain) if self.ctx.is_local_domain(&domain) => {
                local_part(&sender_address).to_lowercase()
            }
            _ => sender_address.clone(),
        };

        let in_reply_to = headers
            .get("in-reply-to")
            .map(|v| message_ids(v))
            .unwrap_or_default();
        let references = headers
            .get("references")
            .map(|v| message_ids(v))
            .unwrap_or_default();

        let decoded = self.ctx.decoder.decode(&sender_address, &self.data).await;

        let mut local = Vec::new();
        let mut remote = Vec::new();
        for recipient in &self.recipients {
            let (to, to_id) = match recipient {
                Recipient::Local { address, username } => (address.clone(), username.clone()),
                Recipient::Remote(address) => (address.clone(), address.clone()),
            };

            let identity = match recipient {
                Recipient::Local { .. } => to_id.as_str(),
                Recipient::Remote(_) => from_id.as_str(),
            };
            let reply_to = self
                .ctx
                .store
                .resolve_parent(
                    Some(identity),
                    in_reply_to.first().map(String::as_str),
                    &references,
                )
                .await;

            let record = NewMessage {
                from: sender_name.clone(),
                from_id: from_id.clone(),
                to,
                to_id,
                subject: subject.clone(),
                body: decoded.body.clone(),
                reply_to,
                message_id: Some(message_id.clone()),
            };

            match recipient {
                Recipient::Local { .. } => local.push(record),
                Recipient::Remote(address) => remote.push(OutboundJob {
                    sender: if envelope_from.is_empty() {
                        sender_address.clone()
                    } else {
                        envelope_from.clone()
                    },
                    recipient: address.clone(),
                    data: self.data.clone(),
                    record,
                }),
            }
        }

        // A 4xx must leave no copy behind; the client retries the whole
        // transaction
        let reservation = if remote.is_empty() {
            None
        } else {
            let Some(queue) = &self.ctx.outbound else {
                return "451 4.3.2 Relaying temporarily unavailable\r\n".to_string();
            };
            match queue.reserve(remote.len()).await {
                Ok(reservation) => Some(reservation),
                Err(e) => {
                    error!("Failed to queue {} for relay: {}", message_id, e);
                    return "451 4.3.0 Outbound queue unavailable\r\n".to_string();
                }
            }
        };

        let stored = local.len();
        if let Err(e) = self.ctx.store.append_all(local).await {
            error!("Failed to store {}: {}", message_id, e);
            return "451 4.3.0 Local storage failure\r\n".to_string();
        }

        let queued = remote.len();
        if let Some(reservation) = reservation {
            reservation.send(remote);
        }

        info!(
            "Accepted {} from {} via {} ({} stored, {} queued)",
            message_id,
            sender_address,
            self.helo_domain.as_deref().unwrap_or("unknown"),
            stored,
            queued
        );
        "250 2.0.0 Message accepted\r\n".to_string()
    }
}

/// Read one line of at most [`MAX_LINE_LENGTH`] bytes
///
/// An overlong line is consumed through its newline so the stream stays in
/// sync. Invalid UTF-8 is replaced rather than rejected.
async fn read_line<R>(reader: &mut R, limit: Duration) -> Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = timeout(
        limit,
        (&mut *reader)
            .take(MAX_LINE_LENGTH as u64 + 1)
            .read_until(b'\n', &mut buf),
    )
    .await;

    let n = match read {
        Ok(result) => result?,
        Err(_) => return Ok(Line::TimedOut),
    };
    if n == 0 {
        return Ok(Line::Closed);
    }

    if buf.len() > MAX_LINE_LENGTH {
        while !buf.ends_with(b"\n") {
            buf.clear();
            let drained = timeout(
                limit,
                (&mut *reader).take(8192).read_until(b'\n', &mut buf),
            )
            .await;
            match drained {
                Ok(Ok(0)) => return Ok(Line::Closed),
                Ok(result) => {
                    result?;
                }
                Err(_) => return Ok(Line::TimedOut),
            }
        }
        return Ok(Line::TooLong);
    }

    Ok(Line::Text(String::from_utf8_lossy(&buf).into_owned()))
}

/// `<a@x> <b@y>` -> `["<a@x>", "<b@y>"]`; bare tokens are bracketed
fn message_ids(value: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = value;

    while let Some(start) = rest.find('<') {
        let Some(end) = rest[start..].find('>') else {
            break;
        };
        let id = rest[start + 1..start + end].trim();
        if !id.is_empty() {
            ids.push(format!("<{}>", id));
        }
        rest = &rest[start + end + 1..];
    }

    if ids.is_empty() {
        ids = value
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| t.contains('@'))
            .map(|t| format!("<{}>", t))
            .collect();
    }

    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::directory::{Account, MockAccountDirectory};
    use crate::security::{Blocklist, RateLimiter, WindowLimit};
    use tokio::io::{duplex, DuplexStream};

    fn context(trusted: Vec<&str>) -> Arc<SmtpContext> {
        let mut config = Config::default();
        config.server.domain = "example.org".to_string();
        config.server.hostname = "mx.example.org".to_string();
        config.smtp.trusted_origins = trusted.into_iter().map(str::to_string).collect();
        config.smtp.max_recipients = 2;
        config.smtp.max_message_size = 512;

        let mut directory = MockAccountDirectory::new();
        directory.expect_lookup().returning(|username| {
            (username == "bob").then(|| Account {
                username: "bob".to_string(),
                can_receive: true,
            })
        });

        let limit = WindowLimit {
            max: 100,
            window: Duration::from_secs(3600),
        };
        Arc::new(SmtpContext {
            config: Arc::new(config),
            guard: Arc::new(Guard::new(
                Arc::new(Blocklist::in_memory()),
                Arc::new(RateLimiter::new(limit, limit)),
            )),
            store: Arc::new(MessageStore::in_memory()),
            directory: Arc::new(directory),
            decoder: Arc::new(ContentDecoder::new(&DecoderConfig::default())),
            spf: None,
            outbound: None,
        })
    }

    async fn exchange(client: &mut BufReader<DuplexStream>, line: &str) -> String {
        client.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        read_reply(client).await
    }

    async fn read_reply(client: &mut BufReader<DuplexStream>) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            client.read_line(&mut line).await.unwrap();
            reply.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return reply;
            }
        }
    }

    fn start(ctx: Arc<SmtpContext>, peer: &str) -> BufReader<DuplexStream> {
        let (client, server) = duplex(16 * 1024);
        let session = SmtpSession::new(ctx, peer.parse().unwrap());
        tokio::spawn(session.handle(server));
        BufReader::new(client)
    }

    #[test]
    fn test_message_ids() {
        assert_eq!(
            message_ids("<a@x.org>\r\n <b@y.org>"),
            vec!["<a@x.org>".to_string(), "<b@y.org>".to_string()]
        );
        assert_eq!(message_ids("c@z.org"), vec!["<c@z.org>".to_string()]);
        assert!(message_ids("").is_empty());
    }

    #[test]
    fn test_trusted_origin_cidr() {
        let ctx = context(vec!["10.0.0.0/8", "::1"]);
        assert!(ctx.is_trusted(&"10.1.2.3".parse().unwrap()));
        assert!(ctx.is_trusted(&"::1".parse().unwrap()));
        assert!(!ctx.is_trusted(&"192.0.2.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_ehlo_advertises_extensions() {
        let mut client = start(context(vec![]), "192.0.2.1");
        assert!(read_reply(&mut client).await.starts_with("220 mx.example.org"));

        let reply = exchange(&mut client, "EHLO client.test").await;
        assert!(reply.contains("250-SIZE 512"));
        assert!(reply.contains("250-8BITMIME"));
        assert!(reply.contains("250-PIPELINING"));
        assert!(reply.ends_with("250 HELP\r\n"));
    }

    #[tokio::test]
    async fn test_command_sequencing() {
        let mut client = start(context(vec![]), "192.0.2.1");
        read_reply(&mut client).await;

        assert!(exchange(&mut client, "MAIL FROM:<a@example.com>").await.starts_with("503"));
        assert!(exchange(&mut client, "HELO client.test").await.starts_with("250"));
        assert!(exchange(&mut client, "DATA").await.starts_with("503"));
        assert!(exchange(&mut client, "VRFY bob").await.starts_with("502"));
        assert!(exchange(&mut client, "MAIL FROM:<not an address>").await.starts_with("501"));
        assert!(exchange(&mut client, "NOOP").await.starts_with("250"));
        assert!(exchange(&mut client, "QUIT").await.starts_with("221"));
    }

    #[tokio::test]
    async fn test_recipient_rules() {
        let mut client = start(context(vec![]), "192.0.2.1");
        read_reply(&mut client).await;
        exchange(&mut client, "EHLO client.test").await;
        assert!(exchange(&mut client, "MAIL FROM:<a@example.com>").await.starts_with("250"));

        assert!(exchange(&mut client, "RCPT TO:<ghost@example.org>").await.starts_with("550 5.1.1"));
        assert!(exchange(&mut client, "RCPT TO:<carol@elsewhere.com>").await.starts_with("550 5.7.1"));
        assert!(exchange(&mut client, "RCPT TO:<Bob@Example.org>").await.starts_with("250"));
        assert!(exchange(&mut client, "RCPT TO:<bob@example.org>").await.starts_with("250"));
        assert!(exchange(&mut client, "RCPT TO:<bob@example.org>").await.starts_with("452"));
    }

    #[tokio::test]
    async fn test_declared_size_over_limit() {
        let mut client = start(context(vec![]), "192.0.2.1");
        read_reply(&mut client).await;
        exchange(&mut client, "EHLO client.test").await;
        assert!(exchange(&mut client, "MAIL FROM:<a@example.com> SIZE=4096")
            .await
            .starts_with("552"));
    }

    #[tokio::test]
    async fn test_oversized_data_is_drained_then_rejected() {
        let ctx = context(vec![]);
        let mut client = start(ctx.clone(), "192.0.2.1");
        read_reply(&mut client).await;
        exchange(&mut client, "EHLO client.test").await;
        exchange(&mut client, "MAIL FROM:<a@example.com>").await;
        exchange(&mut client, "RCPT TO:<bob@example.org>").await;
        assert!(exchange(&mut client, "DATA").await.starts_with("354"));

        let mut body = String::from("Subject: big\r\n\r\n");
        for _ in 0..20 {
            body.push_str(&"x".repeat(60));
            body.push_str("\r\n");
        }
        client.write_all(body.as_bytes()).await.unwrap();
        assert!(exchange(&mut client, ".").await.starts_with("552"));

        // Session is still usable
        assert!(exchange(&mut client, "NOOP").await.starts_with("250"));
        assert!(ctx.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_long_command_line_rejected() {
        let mut client = start(context(vec![]), "192.0.2.1");
        read_reply(&mut client).await;
        let long = format!("NOOP {}", "a".repeat(2000));
        assert!(exchange(&mut client, &long).await.starts_with("500"));
        assert!(exchange(&mut client, "NOOP").await.starts_with("250"));
    }

    #[tokio::test]
    async fn test_error_budget_closes_session() {
        let mut client = start(context(vec![]), "192.0.2.1");
        read_reply(&mut client).await;
        // max_errors defaults to 10
        for _ in 0..10 {
            assert!(exchange(&mut client, "BOGUS").await.starts_with("502"));
        }
        assert!(read_reply(&mut client).await.starts_with("421"));
    }

    #[tokio::test]
    async fn test_unparseable_message_rejected() {
        let ctx = context(vec![]);
        let mut client = start(ctx.clone(), "192.0.2.1");
        read_reply(&mut client).await;
        exchange(&mut client, "HELO client.test").await;
        exchange(&mut client, "MAIL FROM:<a@example.com>").await;
        exchange(&mut client, "RCPT TO:<bob@example.org>").await;
        exchange(&mut client, "DATA").await;
        client.write_all(b"just some words without headers\r\n").await.unwrap();
        assert!(exchange(&mut client, ".").await.starts_with("554 5.6.0"));
        assert!(ctx.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_accepted_message_is_stored() {
        let ctx = context(vec![]);
        let mut client = start(ctx.clone(), "192.0.2.1");
        read_reply(&mut client).await;
        exchange(&mut client, "HELO client.test").await;
        exchange(&mut client, "MAIL FROM:<carol@elsewhere.com>").await;
        exchange(&mut client, "RCPT TO:<bob@example.org>").await;
        exchange(&mut client, "DATA").await;
        client
            .write_all(
                b"From: Carol <carol@elsewhere.com>\r\n\
                  To: bob@example.org\r\n\
                  Subject: Hello\r\n\
                  Message-ID: <m1@elsewhere.com>\r\n\
                  \r\n\
                  ..dotted line\r\n\
                  Hi Bob\r\n",
            )
            .await
            .unwrap();
        assert!(exchange(&mut client, ".").await.starts_with("250"));

        let inbox = ctx.store.inbox("bob").await;
        assert_eq!(inbox.unread_count, 1);
        let message = ctx.store.find_by_message_id("<m1@elsewhere.com>").await.unwrap();
        assert_eq!(message.from, "Carol");
        assert_eq!(message.from_id, "carol@elsewhere.com");
        assert_eq!(message.to_id, "bob");
        assert_eq!(message.subject, "Hello");
        assert!(message.body.contains(".dotted line"));
        assert!(!message.body.contains("..dotted"));
    }
}
