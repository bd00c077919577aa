use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};

use ktl_types::{LogPayload, StreamEvent};

use crate::fabric::Observer;

/// In-process broadcast handle for embedders.
///
/// Remote transports (WebSocket viewers, gRPC agent mirrors) subscribe for
/// a receiver and drain it on their own threads; the bus side is a plain
/// observer. Disconnected subscribers are pruned on the next send.
#[derive(Clone, Default)]
pub struct MirrorBus {
    senders: Arc<Mutex<Vec<Sender<StreamEvent>>>>,
}

impl MirrorBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        let (tx, rx) = channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    /// The observer to attach to an [`crate::EventBus`].
    pub fn observer(&self) -> MirrorObserver {
        MirrorObserver {
            senders: Arc::clone(&self.senders),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    fn broadcast(senders: &Arc<Mutex<Vec<Sender<StreamEvent>>>>, event: &StreamEvent) {
        let mut senders = senders.lock().unwrap();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

pub struct MirrorObserver {
    senders: Arc<Mutex<Vec<Sender<StreamEvent>>>>,
}

impl Observer for MirrorObserver {
    fn name(&self) -> &str {
        "mirror-bus"
    }

    fn handle_deploy_event(&mut self, event: &StreamEvent) -> anyhow::Result<()> {
        MirrorBus::broadcast(&self.senders, event);
        Ok(())
    }

    fn observe_log(&mut self, event: &StreamEvent, _log: &LogPayload) -> anyhow::Result<()> {
        MirrorBus::broadcast(&self.senders, event);
        Ok(())
    }
}
