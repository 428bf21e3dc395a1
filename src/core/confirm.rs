//! Human-approval gate. A requesting task publishes a `confirmation_required`
//! event and parks on a single-shot signal until an external resolver
//! supplies a decision. Only the calling task suspends; the rest of the
//! pipeline keeps running. There is no timeout: callers needing a deadline
//! layer one on themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::core::events::EventBus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub approved: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub request_id: String,
    pub case_id: String,
    pub analyst_kind: String,
    pub description: String,
    pub items: Vec<String>,
    pub context: Option<String>,
    /// RFC 3339, set when the request is registered. A resolver UI sorts
    /// and ages pending requests by this.
    pub created_at: String,
}

enum PendingSignal {
    Single(oneshot::Sender<Decision>),
    Batch {
        item_count: usize,
        tx: oneshot::Sender<Vec<Decision>>,
    },
}

struct Pending {
    request: ConfirmationRequest,
    signal: PendingSignal,
}

pub struct ConfirmationGate {
    pending: Mutex<HashMap<String, Pending>>,
    bus: Arc<EventBus>,
}

impl ConfirmationGate {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Block the calling task until a human decision arrives for this request.
    pub async fn request_confirmation(
        &self,
        case_id: &str,
        analyst_kind: &str,
        description: &str,
        items: Vec<String>,
        context: Option<String>,
    ) -> Result<Decision> {
        let (tx, rx) = oneshot::channel();
        let request = self.register(
            case_id,
            analyst_kind,
            description,
            items,
            context,
            |tx| PendingSignal::Single(tx),
            tx,
        );
        info!(
            "Confirmation required for case [{}]: {} ({})",
            case_id, description, request.request_id
        );
        rx.await
            .map_err(|_| anyhow!("confirmation gate dropped request {}", request.request_id))
    }

    /// Block until one decision per item arrives, delivered as a single
    /// vector so the reviewer sees one multi-item prompt, not N.
    pub async fn request_batch(
        &self,
        case_id: &str,
        analyst_kind: &str,
        description: &str,
        items: Vec<String>,
    ) -> Result<Vec<Decision>> {
        let item_count = items.len();
        let (tx, rx) = oneshot::channel();
        let request = self.register(
            case_id,
            analyst_kind,
            description,
            items,
            None,
            |tx| PendingSignal::Batch { item_count, tx },
            tx,
        );
        info!(
            "Batch confirmation required for case [{}]: {} items ({})",
            case_id, item_count, request.request_id
        );
        rx.await
            .map_err(|_| anyhow!("confirmation gate dropped request {}", request.request_id))
    }

    /// Apply one decision to a pending request. For a batch request the
    /// decision is replicated across every item (blanket approve/reject).
    /// Returns false for an unknown id, including an already-resolved one.
    pub fn resolve(&self, request_id: &str, approved: bool, reason: Option<String>) -> bool {
        let Some(pending) = self.take(request_id) else {
            warn!("Resolve for unknown confirmation request [{}]", request_id);
            return false;
        };
        let decision = Decision { approved, reason };
        let delivered = match pending.signal {
            PendingSignal::Single(tx) => tx.send(decision).is_ok(),
            PendingSignal::Batch { item_count, tx } => {
                tx.send(vec![decision; item_count]).is_ok()
            }
        };
        self.publish_resolved(&pending.request, approved);
        delivered
    }

    /// Per-item decisions for a batch request. The decision count must match
    /// the item count exactly; otherwise the request stays pending.
    pub fn resolve_batch(&self, request_id: &str, decisions: Vec<Decision>) -> bool {
        let mut map = self.pending.lock().expect("confirmation gate lock poisoned");
        let valid = match map.get(request_id) {
            Some(Pending {
                signal: PendingSignal::Batch { item_count, .. },
                ..
            }) => *item_count == decisions.len(),
            _ => false,
        };
        if !valid {
            warn!(
                "Batch resolve rejected for confirmation request [{}]",
                request_id
            );
            return false;
        }
        let pending = map.remove(request_id).expect("checked above");
        drop(map);

        let approved_all = decisions.iter().all(|d| d.approved);
        let delivered = match pending.signal {
            PendingSignal::Batch { tx, .. } => tx.send(decisions).is_ok(),
            PendingSignal::Single(_) => unreachable!("validated as batch"),
        };
        self.publish_resolved(&pending.request, approved_all);
        delivered
    }

    /// Snapshot of requests still awaiting a decision.
    pub fn pending_requests(&self) -> Vec<ConfirmationRequest> {
        let map = self.pending.lock().expect("confirmation gate lock poisoned");
        map.values().map(|p| p.request.clone()).collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn register<T>(
        &self,
        case_id: &str,
        analyst_kind: &str,
        description: &str,
        items: Vec<String>,
        context: Option<String>,
        make_signal: impl FnOnce(oneshot::Sender<T>) -> PendingSignal,
        tx: oneshot::Sender<T>,
    ) -> ConfirmationRequest {
        let request = ConfirmationRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            case_id: case_id.to_string(),
            analyst_kind: analyst_kind.to_string(),
            description: description.to_string(),
            items,
            context,
            created_at: Utc::now().to_rfc3339(),
        };
        {
            // Register before announcing, so a resolver reacting to the event
            // always finds the request.
            let mut map = self.pending.lock().expect("confirmation gate lock poisoned");
            map.insert(
                request.request_id.clone(),
                Pending {
                    request: request.clone(),
                    signal: make_signal(tx),
                },
            );
        }
        self.bus.publish(
            case_id,
            analyst_kind,
            "confirmation_required",
            json!({
                "request_id": request.request_id,
                "description": request.description,
                "items": request.items,
                "context": request.context,
                "created_at": request.created_at,
            }),
        );
        request
    }

    fn take(&self, request_id: &str) -> Option<Pending> {
        let mut map = self.pending.lock().expect("confirmation gate lock poisoned");
        map.remove(request_id)
    }

    fn publish_resolved(&self, request: &ConfirmationRequest, approved: bool) {
        self.bus.publish(
            &request.case_id,
            &request.analyst_kind,
            "confirmation_resolved",
            json!({
                "request_id": request.request_id,
                "approved": approved,
            }),
        );
    }
}
