//! SMTP client for one outbound transaction
//!
//! Speaks the minimal RFC 5321 dialogue against a single MX host: greeting,
//! EHLO, MAIL FROM, RCPT TO, DATA, QUIT. Candidate selection and fallback
//! live in [`crate::smtp::relay`].

use crate::error::{MailError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Upper bound on a single reply line; longer replies are a protocol error
const MAX_REPLY_LINE: usize = 4096;

/// Upper bound on continuation lines in one reply
const MAX_REPLY_LINES: usize = 128;

/// SMTP client bound to one server address
///
/// # Examples
/// ```no_run
/// use mta_rs::smtp::SmtpClient;
/// use std::time::Duration;
///
/// # async fn example() -> mta_rs::Result<()> {
/// let client = SmtpClient::new("mx.example.com:25", "mail.example.org", Duration::from_secs(60));
/// client
///     .send_mail(
///         Duration::from_secs(30),
///         "sender@example.org",
///         "recipient@example.com",
///         b"Subject: Test\r\n\r\nHello!\r\n",
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SmtpClient {
    server_addr: String,
    helo_name: String,
    command_timeout: Duration,
}

impl SmtpClient {
    pub fn new(server_addr: &str, helo_name: &str, command_timeout: Duration) -> Self {
        Self {
            server_addr: server_addr.to_string(),
            helo_name: helo_name.to_string(),
            command_timeout,
        }
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Connect (bounded by `connect_timeout`) and run one transaction
    pub async fn send_mail(
        &self,
        connect_timeout: Duration,
        from: &str,
        to: &str,
        data: &[u8],
    ) -> Result<()> {
        let stream = timeout(connect_timeout, TcpStream::connect(&self.server_addr))
            .await
            .map_err(|_| {
                MailError::SmtpProtocol(format!("Connect to {} timed out", self.server_addr))
            })??;

        self.transact(stream, from, to, data).await
    }

    /// Run the transaction over an already established stream
    pub async fn transact<S>(&self, stream: S, from: &str, to: &str, data: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!("Sending mail from {} to {} via {}", from, to, self.server_addr);

        let mut stream = BufReader::new(stream);

        let greeting = self.read_response(&mut stream).await?;
        expect_code(&greeting, "220")?;
        debug!("Received greeting: {}", greeting.trim());

        self.command(&mut stream, &format!("EHLO {}", self.helo_name), "250")
            .await?;
        self.command(&mut stream, &format!("MAIL FROM:<{}>", from), "250")
            .await?;
        self.command(&mut stream, &format!("RCPT TO:<{}>", to), "250")
            .await?;
        self.command(&mut stream, "DATA", "354").await?;

        stream.write_all(&dot_stuff(data)).await?;
        stream.flush().await?;
        let accepted = self.read_response(&mut stream).await?;
        expect_code(&accepted, "250")?;

        // The message is already accepted; a failed QUIT does not matter
        if let Err(e) = self.command(&mut stream, "QUIT", "221").await {
            debug!("QUIT to {} failed: {}", self.server_addr, e);
        }

        info!("Mail sent successfully to {} via {}", to, self.server_addr);
        Ok(())
    }

    async fn command<S>(&self, stream: &mut BufReader<S>, line: &str, expected: &str) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("> {}", line);
        stream.write_all(format!("{}\r\n", line).as_bytes()).await?;
        stream.flush().await?;

        let response = self.read_response(stream).await?;
        expect_code(&response, expected)?;
        Ok(response)
    }

    /// Read a possibly multi-line reply (`250-...` continuation lines)
    async fn read_response<S>(&self, stream: &mut BufReader<S>) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut full_response = String::new();

        for _ in 0..MAX_REPLY_LINES {
            let mut buf = Vec::new();
            let n = timeout(
                self.command_timeout,
                (&mut *stream)
                    .take(MAX_REPLY_LINE as u64 + 1)
                    .read_until(b'\n', &mut buf),
            )
            .await
            .map_err(|_| {
                MailError::SmtpProtocol(format!("Timeout waiting for {}", self.server_addr))
            })??;

            if n == 0 {
                return Err(MailError::SmtpProtocol(format!(
                    "{} closed the connection",
                    self.server_addr
                )));
            }
            if buf.len() > MAX_REPLY_LINE {
                return Err(MailError::SmtpProtocol("Reply line too long".to_string()));
            }

            let line = String::from_utf8_lossy(&buf);
            debug!("< {}", line.trim_end());
            full_response.push_str(&line);

            // Last line has a space (or nothing) after the code
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return Ok(full_response);
            }
        }

        Err(MailError::SmtpProtocol(format!(
            "{} sent more than {} reply lines",
            self.server_addr, MAX_REPLY_LINES
        )))
    }
}

fn expect_code(response: &str, expected: &str) -> Result<()> {
    if response.starts_with(expected) {
        return Ok(());
    }
    error!("Unexpected response: {}", response.trim_end());
    Err(MailError::SmtpProtocol(format!(
        "Expected {}, got: {}",
        expected,
        response.trim_end()
    )))
}

/// Normalise line endings to CRLF, double leading dots and append the
/// `.` terminator
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);

    for line in data.split_inclusive(|&b| b == b'\n') {
        let content = line
            .strip_suffix(b"\n")
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .unwrap_or(line);
        if content.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(content);
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b".\r\n");
    out
}
