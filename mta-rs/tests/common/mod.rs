//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use mta_rs::config::{AccountConfig, Config};
use mta_rs::directory::StaticDirectory;
use mta_rs::dns::{DnsResolver, MxRecord};
use mta_rs::mime::ContentDecoder;
use mta_rs::security::{Blocklist, Guard, RateLimiter, WindowLimit};
use mta_rs::smtp::{OutboundQueue, SmtpContext, SmtpSession};
use mta_rs::storage::MessageStore;
use mta_rs::MailError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpListener;

pub const DOMAIN: &str = "example.org";
pub const TRUSTED_IP: &str = "127.0.0.1";
pub const UNTRUSTED_IP: &str = "198.51.100.20";

pub fn config() -> Config {
    let mut config = Config::default();
    config.server.domain = DOMAIN.to_string();
    config.server.hostname = "mx.example.org".to_string();
    config.smtp.trusted_origins = vec![TRUSTED_IP.to_string()];
    config.guard.blocklist_path = None;
    config.accounts = vec![
        AccountConfig {
            username: "bob".to_string(),
            can_receive: true,
        },
        AccountConfig {
            username: "carol".to_string(),
            can_receive: true,
        },
        AccountConfig {
            username: "suspended".to_string(),
            can_receive: false,
        },
    ];
    config
}

pub struct Harness {
    pub ctx: Arc<SmtpContext>,
    pub outbound: Option<tokio::sync::mpsc::Receiver<mta_rs::smtp::OutboundJob>>,
}

impl Harness {
    pub fn new(connection_limit: WindowLimit) -> Self {
        Self::with_config(config(), connection_limit)
    }

    pub fn with_config(config: Config, connection_limit: WindowLimit) -> Self {
        let sender_limit = WindowLimit {
            max: config.guard.messages_per_day,
            window: Duration::from_secs(86_400),
        };
        let guard = Guard::new(
            Arc::new(Blocklist::in_memory()),
            Arc::new(RateLimiter::new(connection_limit, sender_limit)),
        );
        let (queue, receiver) = OutboundQueue::channel(16);

        let ctx = SmtpContext {
            directory: Arc::new(StaticDirectory::new(&config.accounts)),
            decoder: Arc::new(ContentDecoder::new(&config.decoder)),
            config: Arc::new(config),
            guard: Arc::new(guard),
            store: Arc::new(MessageStore::in_memory()),
            spf: None,
            outbound: Some(queue),
        };

        Self {
            ctx: Arc::new(ctx),
            outbound: Some(receiver),
        }
    }

    pub fn connect(&self, peer: &str) -> Client {
        let (client, server) = duplex(64 * 1024);
        let peer: IpAddr = peer.parse().unwrap();
        let session = SmtpSession::new(self.ctx.clone(), peer);
        tokio::spawn(session.handle(server));
        Client {
            stream: BufReader::new(client),
        }
    }
}

pub fn hourly(max: u32) -> WindowLimit {
    WindowLimit {
        max,
        window: Duration::from_secs(3600),
    }
}

/// Client side of an in-memory SMTP conversation
pub struct Client {
    stream: BufReader<DuplexStream>,
}

impl Client {
    pub async fn reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            if self.stream.read_line(&mut line).await.unwrap() == 0 {
                return reply;
            }
            reply.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return reply;
            }
        }
    }

    pub async fn send(&mut self, line: &str) -> String {
        self.stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
        self.reply().await
    }

    /// DATA body followed by the terminator; returns the final reply
    pub async fn data(&mut self, body: &str) -> String {
        let reply = self.send("DATA").await;
        assert!(reply.starts_with("354"), "DATA refused: {}", reply);
        self.stream.write_all(body.as_bytes()).await.unwrap();
        if !body.ends_with("\r\n") {
            self.stream.write_all(b"\r\n").await.unwrap();
        }
        self.send(".").await
    }

    /// Greeting, EHLO, MAIL FROM, then each RCPT TO; returns the RCPT replies
    pub async fn envelope(&mut self, from: &str, recipients: &[&str]) -> Vec<String> {
        assert!(self.reply().await.starts_with("220"));
        assert!(self.send("EHLO client.test").await.starts_with("250"));
        let reply = self.send(&format!("MAIL FROM:<{}>", from)).await;
        assert!(reply.starts_with("250"), "MAIL FROM refused: {}", reply);

        let mut replies = Vec::new();
        for recipient in recipients {
            replies.push(self.send(&format!("RCPT TO:<{}>", recipient)).await);
        }
        replies
    }
}

/// Resolver with fixed MX answers
#[derive(Default)]
pub struct StaticResolver {
    pub mx: HashMap<String, Vec<MxRecord>>,
}

#[async_trait]
impl DnsResolver for StaticResolver {
    async fn mx(&self, domain: &str) -> mta_rs::Result<Vec<MxRecord>> {
        self.mx
            .get(domain)
            .cloned()
            .ok_or_else(|| MailError::DnsLookup(format!("NXDOMAIN {}", domain)))
    }

    async fn txt(&self, _domain: &str) -> mta_rs::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn ips(&self, _host: &str) -> mta_rs::Result<Vec<IpAddr>> {
        Ok(Vec::new())
    }
}

/// Minimal SMTP receiver on loopback that records every accepted message
pub struct FakeMx {
    pub port: u16,
    pub deliveries: Arc<AtomicUsize>,
    pub messages: Arc<Mutex<Vec<String>>>,
}

impl FakeMx {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let deliveries = Arc::new(AtomicUsize::new(0));
        let messages = Arc::new(Mutex::new(Vec::new()));

        let counter = deliveries.clone();
        let store = messages.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let counter = counter.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    let mut stream = BufReader::new(socket);
                    stream.write_all(b"220 fake.mx ESMTP\r\n").await.unwrap();
                    let mut body = String::new();
                    let mut in_data = false;
                    loop {
                        let mut line = String::new();
                        if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        if in_data {
                            if line == ".\r\n" {
                                in_data = false;
                                counter.fetch_add(1, Ordering::SeqCst);
                                store.lock().unwrap().push(std::mem::take(&mut body));
                                stream.write_all(b"250 2.0.0 queued\r\n").await.unwrap();
                            } else {
                                body.push_str(&line);
                            }
                            continue;
                        }
                        let verb = line.get(..4).unwrap_or("").to_ascii_uppercase();
                        let reply: &[u8] = match verb.as_str() {
                            "EHLO" | "HELO" => b"250-fake.mx\r\n250 8BITMIME\r\n",
                            "DATA" => {
                                in_data = true;
                                b"354 go ahead\r\n"
                            }
                            "QUIT" => {
                                let _ = stream.write_all(b"221 bye\r\n").await;
                                return;
                            }
                            _ => b"250 OK\r\n",
                        };
                        stream.write_all(reply).await.unwrap();
                    }
                });
            }
        });

        Self {
            port,
            deliveries,
            messages,
        }
    }

    pub fn delivered(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

/// A loopback port with nothing listening on it
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
