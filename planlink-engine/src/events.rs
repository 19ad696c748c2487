//! Outbound notifications and unsolicited-message routing.
//!
//! Sessions and the health service never call application code directly.
//! They push [`PlanEvent`]s into an [`EventTx`]; an [`EventBridge`] task
//! drains the channel and invokes the registered [`PlanHandler`], so a slow
//! handler cannot stall a transfer.

use std::sync::Arc;

// ---

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ---

use planlink_domain::{FlashProgress, LinkMessage, LinkStatus, PlanHandler, TransferProgress};

// ---------------------------------------------------------------------------
// PlanEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum PlanEvent {
    // ---
    Progress(TransferProgress),

    FlashProgress(FlashProgress),

    /// Terminal outcome of a coordinator operation.
    Result { success: bool, errors: Vec<String> },

    LinkStatus(LinkStatus),
}

// ---------------------------------------------------------------------------
// EventTx
// ---------------------------------------------------------------------------

/// Cheap-clone sender for [`PlanEvent`]s. A disabled sender discards events.
#[derive(Debug, Clone)]
pub struct EventTx {
    // ---
    tx: Option<mpsc::UnboundedSender<PlanEvent>>,
}

// ---

impl EventTx {
    // ---
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PlanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Returns `false` if nobody is listening.
    pub fn send(&self, event: PlanEvent) -> bool {
        // ---
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        if tx.send(event).is_err() {
            tracing::debug!("event channel closed — dropping plan event");
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// EventBridge
// ---------------------------------------------------------------------------

/// Forwards [`PlanEvent`]s to a [`PlanHandler`], in order.
pub struct EventBridge {
    // ---
    rx: mpsc::UnboundedReceiver<PlanEvent>,
    handler: Arc<dyn PlanHandler>,
}

// ---

impl EventBridge {
    // ---
    /// Spawn the bridge task. It exits when every [`EventTx`] is dropped.
    pub fn spawn(handler: Arc<dyn PlanHandler>) -> (EventTx, JoinHandle<()>) {
        // ---
        let (tx, rx) = EventTx::channel();
        let bridge = EventBridge { rx, handler };
        (tx, tokio::spawn(bridge.run()))
    }

    // ---

    async fn run(mut self) {
        // ---
        while let Some(event) = self.rx.recv().await {
            match event {
                PlanEvent::Progress(progress) => self.handler.on_progress(progress).await,
                PlanEvent::FlashProgress(progress) => self.handler.on_flash_progress(progress).await,
                PlanEvent::Result { success, errors } => self.handler.on_result(success, errors).await,
                PlanEvent::LinkStatus(status) => self.handler.on_link_status_update(status).await,
            }
        }
        tracing::debug!("event bridge: all senders dropped — exiting");
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Destination for inbound messages that no running session expects.
///
/// Such messages are never consumed silently: they are handed to the
/// application's generic message handling if one is attached, and logged
/// otherwise.
#[derive(Debug, Clone)]
pub struct Router {
    // ---
    tx: Option<mpsc::UnboundedSender<LinkMessage>>,
}

// ---

impl Router {
    // ---
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn route(&self, msg: LinkMessage) {
        // ---
        let name = msg.name();
        let delivered = self.tx.as_ref().is_some_and(|tx| tx.send(msg).is_ok());
        if !delivered {
            tracing::debug!(msg = name, "unsolicited message with no listener");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Mutex;

    use async_trait::async_trait;
    use planlink_domain::CollectionType;

    use super::*;

    // ---

    #[derive(Default)]
    struct Recorder {
        results: Mutex<Vec<(bool, Vec<String>)>>,
        progress: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PlanHandler for Recorder {
        async fn on_progress(&self, progress: TransferProgress) {
            self.progress.lock().unwrap().push(progress.items_done);
        }

        async fn on_result(&self, success: bool, errors: Vec<String>) {
            self.results.lock().unwrap().push((success, errors));
        }
    }

    // ---

    #[tokio::test]
    async fn bridge_delivers_events_in_order() {
        // ---
        let recorder = Arc::new(Recorder::default());
        let (tx, task) = EventBridge::spawn(recorder.clone());

        for done in 1..=3 {
            tx.send(PlanEvent::Progress(TransferProgress {
                kind: CollectionType::Mission,
                items_done: done,
                items_total: 3,
            }));
        }
        tx.send(PlanEvent::Result {
            success: false,
            errors: vec!["mission: operation cancelled".into()],
        });
        drop(tx);
        task.await.unwrap();

        assert_eq!(*recorder.progress.lock().unwrap(), vec![1, 2, 3]);
        let results = recorder.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].0);
    }

    // ---

    #[test]
    fn router_hands_off_unsolicited_messages() {
        // ---
        let (router, mut rx) = Router::channel();
        router.route(LinkMessage::Heartbeat);
        assert_eq!(rx.try_recv().unwrap(), LinkMessage::Heartbeat);

        Router::detached().route(LinkMessage::Heartbeat);
        assert!(!EventTx::disabled().send(PlanEvent::Result {
            success: true,
            errors: vec![]
        }));
    }
}
