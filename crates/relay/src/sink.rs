//! Delivery sink contract.
//!
//! The chat layer renders task output as an editable card. The bridge only
//! creates the card and edits it; transport details stay on the other side.

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use tokio::sync::OnceCell;

use crate::throttle::Deliver;

/// Text shown on a card before the agent has produced anything.
pub const PLACEHOLDER_TEXT: &str = "Thinking...";

/// Opaque reference to a created card.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(pub String);

/// Card lifecycle as reflected in its title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStatus {
    Running,
    Done,
    Failed,
    TimedOut,
}

impl CardStatus {
    /// Title decorated with the status.
    pub fn title(self, base: &str) -> String {
        let status = match self {
            CardStatus::Running => "running",
            CardStatus::Done => "done",
            CardStatus::Failed => "failed",
            CardStatus::TimedOut => "timed out",
        };
        format!("{base} · {status}")
    }
}

/// External renderer for streamed text. Calls are issued strictly in order.
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    async fn create(&self, initial_text: &str, title: &str) -> anyhow::Result<DeliveryHandle>;

    async fn update(&self, handle: &DeliveryHandle, text: &str, title: &str) -> anyhow::Result<()>;
}

/// One card of a `DeliverySink`, created on first use.
///
/// Creation happens off the run loop: the card is opened by a background task
/// and every delivery waits for that single `create` to finish, so updates
/// still reach the sink in issuance order.
pub(crate) struct CardTarget {
    sink: Arc<dyn DeliverySink>,
    card: OnceCell<Option<DeliveryHandle>>,
    base_title: String,
}

impl CardTarget {
    pub(crate) fn new(sink: Arc<dyn DeliverySink>, base_title: String) -> Self {
        Self {
            sink,
            card: OnceCell::new(),
            base_title,
        }
    }

    /// The card handle, creating the card with the placeholder text if needed.
    /// `None` means creation failed; the final text still reaches the caller.
    pub(crate) async fn open(&self) -> Option<&DeliveryHandle> {
        self.card
            .get_or_init(|| async {
                let title = CardStatus::Running.title(&self.base_title);
                match self.sink.create(PLACEHOLDER_TEXT, &title).await {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!("Failed to create card '{}': {:?}", self.base_title, e);
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    /// Terminal update with a status title.
    pub(crate) async fn finish(&self, text: &str, status: CardStatus) {
        let Some(handle) = self.open().await else {
            return;
        };
        if let Err(e) = self
            .sink
            .update(handle, text, &status.title(&self.base_title))
            .await
        {
            warn!("Final card update failed: {:?}", e);
        }
    }
}

#[async_trait]
impl Deliver for CardTarget {
    async fn deliver(&self, text: String) -> anyhow::Result<()> {
        let Some(handle) = self.open().await else {
            return Ok(());
        };
        self.sink
            .update(handle, &text, &CardStatus::Running.title(&self.base_title))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        creates: AtomicUsize,
        updates: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DeliverySink for CountingSink {
        async fn create(&self, _initial_text: &str, _title: &str) -> anyhow::Result<DeliveryHandle> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(DeliveryHandle(format!("card-{n}")))
        }

        async fn update(&self, handle: &DeliveryHandle, text: &str, title: &str) -> anyhow::Result<()> {
            assert_eq!(handle.0, "card-0");
            self.updates
                .lock()
                .unwrap()
                .push((text.to_string(), title.to_string()));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_card_is_created_once_before_updates() {
        let sink = Arc::new(CountingSink::default());
        let card = Arc::new(CardTarget::new(sink.clone(), "Agent".to_string()));

        let opener = {
            let card = Arc::clone(&card);
            tokio::spawn(async move {
                card.open().await.cloned()
            })
        };
        card.deliver("partial".to_string()).await.unwrap();
        card.finish("final", CardStatus::Done).await;

        assert_eq!(opener.await.unwrap(), Some(DeliveryHandle("card-0".to_string())));
        assert_eq!(sink.creates.load(Ordering::SeqCst), 1);
        assert_eq!(
            *sink.updates.lock().unwrap(),
            vec![
                ("partial".to_string(), "Agent · running".to_string()),
                ("final".to_string(), "Agent · done".to_string()),
            ]
        );
    }

    #[test]
    fn test_status_titles() {
        assert_eq!(CardStatus::Running.title("Agent"), "Agent · running");
        assert_eq!(CardStatus::TimedOut.title("Agent"), "Agent · timed out");
    }
}
