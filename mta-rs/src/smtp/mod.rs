//! SMTP server and client implementation (RFC 5321)
//!
//! - [`server`]: accept loop, one task per connection
//! - [`session`]: inbound session state machine
//! - [`commands`]: command line parsing
//! - [`client`]: one outbound SMTP transaction
//! - [`relay`]: MX resolution and ordered fallback
//! - [`mailer`]: application-facing send (credit gate, signing, local copy)
//! - [`queue`]: in-process outbound queue fed by trusted sessions

pub mod client;
pub mod commands;
pub mod mailer;
pub mod queue;
pub mod relay;
pub mod server;
pub mod session;

pub use client::SmtpClient;
pub use commands::SmtpCommand;
pub use mailer::{CreditGate, Mailer, OutgoingMail, UnmeteredCredits};
pub use queue::{OutboundJob, OutboundQueue, QueueWorker, Reservation};
pub use relay::{DeliveryReport, MxCandidate, OutboundRelay};
pub use server::SmtpServer;
pub use session::{SmtpContext, SmtpSession};
