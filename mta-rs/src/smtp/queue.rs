//! Outbound queue between inbound sessions and the relay
//!
//! In-process only. A trusted session that accepts mail for an external
//! recipient enqueues one [`OutboundJob`] per recipient; the worker relays
//! each job once and records the local copy only when delivery succeeds.
//!
//! ```text
//! ┌─────────┐
//! │ Session │ → [channel] → [Worker] → [Mailer::relay_raw] → ✓ stored
//! └─────────┘                                  ↓
//!                                              X logged, dropped
//! ```

use crate::error::{MailError, Result};
use crate::smtp::mailer::Mailer;
use crate::smtp::relay::DeliveryReport;
use crate::storage::{MessageStore, NewMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct OutboundJob {
    /// Envelope sender
    pub sender: String,
    /// Envelope recipient
    pub recipient: String,
    /// Wire message, unsigned
    pub data: Vec<u8>,
    /// Stored after a successful relay
    pub record: NewMessage,
}

/// Cloneable handle sessions use to enqueue jobs
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    sender: mpsc::Sender<OutboundJob>,
}

impl OutboundQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub async fn enqueue(&self, job: OutboundJob) -> Result<()> {
        debug!("Queueing {} -> {}", job.sender, job.recipient);
        self.sender.send(job).await.map_err(|_| closed())
    }

    /// Reserve room for `count` jobs before any of them is sent
    ///
    /// Fails without side effects when the worker is gone or `count` exceeds
    /// the channel capacity.
    pub async fn reserve(&self, count: usize) -> Result<Reservation<'_>> {
        if count > self.sender.max_capacity() {
            return Err(MailError::SmtpProtocol(format!(
                "{} jobs exceed the outbound queue capacity of {}",
                count,
                self.sender.max_capacity()
            )));
        }

        let mut permits = Vec::with_capacity(count);
        for _ in 0..count {
            permits.push(self.sender.reserve().await.map_err(|_| closed())?);
        }
        Ok(Reservation { permits })
    }
}

/// Capacity held in the queue; dropping it releases the slots unused
pub struct Reservation<'a> {
    permits: Vec<mpsc::Permit<'a, OutboundJob>>,
}

impl Reservation<'_> {
    /// Hand the jobs to the worker; cannot fail once reserved
    pub fn send(self, jobs: Vec<OutboundJob>) {
        debug_assert_eq!(self.permits.len(), jobs.len());
        for (permit, job) in self.permits.into_iter().zip(jobs) {
            debug!("Queueing {} -> {}", job.sender, job.recipient);
            permit.send(job);
        }
    }
}

fn closed() -> MailError {
    MailError::SmtpProtocol("Outbound queue is closed".to_string())
}

pub struct QueueWorker {
    receiver: mpsc::Receiver<OutboundJob>,
    mailer: Arc<Mailer>,
    store: Arc<MessageStore>,
}

impl QueueWorker {
    pub fn new(
        receiver: mpsc::Receiver<OutboundJob>,
        mailer: Arc<Mailer>,
        store: Arc<MessageStore>,
    ) -> Self {
        Self {
            receiver,
            mailer,
            store,
        }
    }

    /// Relay one job; the record is persisted only on success
    pub async fn process(&self, job: OutboundJob) -> Result<DeliveryReport> {
        info!("Relaying queued mail {} -> {}", job.sender, job.recipient);

        let report = self
            .mailer
            .relay_raw(&job.sender, &job.recipient, job.data)
            .await?;
        self.store.append(job.record).await?;
        Ok(report)
    }

    /// Runs until every [`OutboundQueue`] handle is dropped
    pub async fn run(mut self) {
        info!("Starting outbound queue worker");

        while let Some(job) = self.receiver.recv().await {
            let recipient = job.recipient.clone();
            if let Err(e) = self.process(job).await {
                error!("Queued delivery to {} failed: {}", recipient, e);
            }
        }

        info!("Outbound queue closed, worker stopping");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
