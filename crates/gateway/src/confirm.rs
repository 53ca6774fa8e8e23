use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::tier::SecurityTier;

/// A request sent from the gateway to whatever UI is attached (the terminal
/// running `domshell gateway`) asking a human to approve one command.
pub struct ConfirmRequest {
    pub session_id: String,
    pub command: String,
    pub tier: SecurityTier,
    pub response_tx: oneshot::Sender<bool>,
}

/// Outcome of asking for confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Approved,
    Denied,
    TimedOut,
}

/// Ask the confirmation channel and wait up to `timeout`. A missing channel,
/// a dropped responder or silence all count as a refusal.
pub async fn ask(
    confirm_tx: Option<&mpsc::Sender<ConfirmRequest>>,
    session_id: &str,
    command: &str,
    tier: SecurityTier,
    timeout: Duration,
) -> Confirmation {
    let Some(confirm_tx) = confirm_tx else {
        warn!(command, "No confirmation channel, denying command");
        return Confirmation::Denied;
    };

    let (response_tx, response_rx) = oneshot::channel();
    let request = ConfirmRequest {
        session_id: session_id.to_string(),
        command: command.to_string(),
        tier,
        response_tx,
    };

    let waited = tokio::time::timeout(timeout, async {
        if confirm_tx.send(request).await.is_err() {
            warn!("Failed to send confirmation request, denying command");
            return Confirmation::Denied;
        }
        match response_rx.await {
            Ok(true) => Confirmation::Approved,
            Ok(false) => Confirmation::Denied,
            Err(_) => {
                warn!("Confirmation channel closed, denying command");
                Confirmation::Denied
            }
        }
    })
    .await;

    waited.unwrap_or(Confirmation::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_approved_and_denied() {
        let (tx, mut rx) = mpsc::channel::<ConfirmRequest>(4);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.response_tx.send(req.command.starts_with("click"));
            }
        });
        let t = Duration::from_secs(5);
        assert_eq!(
            ask(Some(&tx), "s", "click a", SecurityTier::Write, t).await,
            Confirmation::Approved
        );
        assert_eq!(
            ask(Some(&tx), "s", "type a b", SecurityTier::Write, t).await,
            Confirmation::Denied
        );
    }

    #[tokio::test]
    async fn test_silence_times_out_and_closed_channel_denies() {
        let (tx, mut rx) = mpsc::channel::<ConfirmRequest>(4);
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(req) = rx.recv().await {
                held.push(req);
            }
        });
        let outcome = ask(Some(&tx), "s", "click a", SecurityTier::Write, Duration::from_millis(50)).await;
        assert_eq!(outcome, Confirmation::TimedOut);
        holder.abort();

        let (tx, rx) = mpsc::channel::<ConfirmRequest>(1);
        drop(rx);
        let outcome = ask(Some(&tx), "s", "click a", SecurityTier::Write, Duration::from_secs(1)).await;
        assert_eq!(outcome, Confirmation::Denied);
        assert_eq!(
            ask(None, "s", "click a", SecurityTier::Write, Duration::from_secs(1)).await,
            Confirmation::Denied
        );
    }
}
