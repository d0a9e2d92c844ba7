use crate::error::Result;
use crate::smtp::session::{SmtpContext, SmtpSession};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub struct SmtpServer {
    ctx: Arc<SmtpContext>,
}

impl SmtpServer {
    pub fn new(ctx: SmtpContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.ctx.config.smtp.listen_addr).await?;
        info!("SMTP server listening on {}", self.ctx.config.smtp.listen_addr);
        Ok(listener)
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener, one task per connection
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    info!("New SMTP connection from {}", addr);

                    let session = SmtpSession::new(self.ctx.clone(), addr.ip());
                    tokio::spawn(async move {
                        if let Err(e) = session.handle(socket).await {
                            error!("Session error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
