//! Resume signaller backed by a tokio channel.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ResumeSignal, ResumeSignaller};
use crate::error::{Error, Result};

/// Sends resume signals to an engine task over an unbounded channel.
///
/// The receiving half is typically owned by the task that calls
/// `handle_resume` for each delivered callback id.
#[derive(Debug, Clone)]
pub struct ChannelResumeSignaller {
    sender: mpsc::UnboundedSender<ResumeSignal>,
}

impl ChannelResumeSignaller {
    /// Creates a signaller and the receiver the engine drains.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResumeSignal>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ResumeSignaller for ChannelResumeSignaller {
    async fn signal(&self, signal: ResumeSignal) -> Result<()> {
        debug!(callback_id = %signal.callback_id, outcome = %signal.outcome, "sending resume signal");
        self.sender.send(signal).map_err(|e| Error::Signal {
            message: format!("resume receiver dropped for {}", e.0.callback_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::ConsumerId;

    use super::*;
    use crate::resume::ResumeOutcome;

    #[tokio::test]
    async fn delivers_to_receiver() {
        let (signaller, mut receiver) = ChannelResumeSignaller::new();
        let id = ConsumerId::generate();
        signaller
            .signal(ResumeSignal::new(id, ResumeOutcome::Promoted))
            .await
            .unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.callback_id, id);
    }

    #[tokio::test]
    async fn dropped_receiver_is_a_signal_error() {
        let (signaller, receiver) = ChannelResumeSignaller::new();
        drop(receiver);
        let err = signaller
            .signal(ResumeSignal::new(ConsumerId::generate(), ResumeOutcome::Rejected))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Signal { .. }));
    }
}
