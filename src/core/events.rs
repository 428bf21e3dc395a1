//! Per-case lifecycle event bus. Every case keeps a bounded ring of recent
//! events so a late subscriber can reconstruct history before going live.
//! Publishing never blocks: a subscriber whose queue is full loses that
//! event, not the publisher.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct CaseEvent {
    pub case_id: String,
    /// Subject of the event (analyst kind or pipeline stage). Replay
    /// exclusion filters match on this, not on `event_type`.
    pub kind: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

struct CaseChannel {
    buffer: VecDeque<CaseEvent>,
    subscribers: Vec<mpsc::Sender<CaseEvent>>,
}

impl CaseChannel {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            subscribers: Vec::new(),
        }
    }
}

pub struct EventBus {
    // One lock covers buffers and subscriber lists: replay + live
    // registration must be atomic with respect to publishing.
    channels: Mutex<HashMap<String, CaseChannel>>,
    buffer_capacity: usize,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new(buffer_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            buffer_capacity: buffer_capacity.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn publish(
        &self,
        case_id: &str,
        kind: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) {
        let event = CaseEvent {
            case_id: case_id.to_string(),
            kind: kind.to_string(),
            event_type: event_type.to_string(),
            payload,
        };

        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        let channel = channels
            .entry(case_id.to_string())
            .or_insert_with(CaseChannel::new);

        if channel.buffer.len() == self.buffer_capacity {
            channel.buffer.pop_front();
        }
        channel.buffer.push_back(event.clone());

        channel.subscribers.retain(|tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop the event for this subscriber only.
                    warn!(
                        "Event subscriber queue full for case [{}], dropping {}",
                        event.case_id, event.event_type
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Register a subscriber. The receiver first yields the buffered events
    /// whose `kind` is not excluded, then live events with no gap. The
    /// exclusion applies to replay only: a caller excludes kinds it already
    /// holds a fresher snapshot for, and live events are newer than any
    /// snapshot.
    pub fn subscribe(&self, case_id: &str, exclude_kinds: &[&str]) -> mpsc::Receiver<CaseEvent> {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        let channel = channels
            .entry(case_id.to_string())
            .or_insert_with(CaseChannel::new);

        // Queue must hold the full replay up front.
        let (tx, rx) = mpsc::channel(self.queue_capacity.max(channel.buffer.len()));

        for event in &channel.buffer {
            if exclude_kinds.contains(&event.kind.as_str()) {
                continue;
            }
            // Capacity covers the whole buffer; a failure here means the
            // receiver was dropped before we returned it, which cannot happen.
            let _ = tx.try_send(event.clone());
        }
        channel.subscribers.push(tx);
        rx
    }

    /// Number of live subscribers for a case.
    pub fn subscriber_count(&self, case_id: &str) -> usize {
        let channels = self.channels.lock().expect("event bus lock poisoned");
        channels.get(case_id).map_or(0, |c| c.subscribers.len())
    }

    /// Drop the case's buffer and subscriber list. Called when a pipeline
    /// reaches a terminal state; subscribers see their channel close.
    pub fn remove_case(&self, case_id: &str) {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        channels.remove(case_id);
    }
}
