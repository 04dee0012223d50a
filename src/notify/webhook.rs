use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::Client;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

use super::Notification;
use crate::scheduler::ScheduledTask;

/// Posts notifications as JSON to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    pub async fn send(&self, n: &Notification) -> Result<()> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(n)
                .send()
                .await;

            let err = match res {
                Ok(rsp) => match rsp.error_for_status_ref() {
                    Ok(_) => return Ok(()),
                    Err(e) => anyhow!("webhook HTTP error: {e}"),
                },
                Err(e) => anyhow!("webhook request failed: {e}"),
            };
            if attempt >= self.max_retries {
                return Err(err);
            }
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}

/// Forward `Converged` notifications to the webhook until cancelled.
pub fn spawn_forwarder(mut rx: broadcast::Receiver<Notification>, notifier: WebhookNotifier) -> ScheduledTask {
    ScheduledTask::spawn_with_shutdown("webhook-forwarder", move |mut shutdown: watch::Receiver<bool>| async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = rx.recv() => match msg {
                    Ok(n @ Notification::Converged { .. }) => {
                        if let Err(e) = notifier.send(&n).await {
                            tracing::warn!(target: "notify", error = %e, "convergence webhook failed");
                        } else {
                            metrics::counter!("notifications_sent_total", "kind" => n.kind()).increment(1);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "notify", skipped, "webhook forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}
