//! Named-channel router connecting page, console and backend.
//!
//! The router is the single point of truth for the current binding, the handler table and the
//! wire audit trail. Handler and page-callback failures (errors or panics) are isolated: they are
//! reported on the console channel and dispatch carries on.

use crate::bus::wire::{WireEntry, WireLog};
use crate::error::Result;
use crate::session::binding::Binding;
use crate::types::envelope::{Envelope, Party};
use crate::types::ids::{Route, SessionKey, TabId};
use crate::types::state::OrchestratorStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Resolves the binding commands without an explicit tab belong to.
pub type BindingAccessor = Arc<dyn Fn() -> Option<Binding> + Send + Sync>;

/// Page delivery callback: `(channel, envelope)`.
///
/// Invoked inline on the delivering task and must not block. It may deliver commands back
/// through the router, including stopping the run whose event it is handling.
pub type PageCallback = Arc<dyn Fn(&str, &Envelope) + Send + Sync>;

/// Channel handler.
pub type Handler = Arc<dyn Fn(&Envelope) -> Result<()> + Send + Sync>;

/// Console channel that receives handler failures
pub const HANDLER_ERROR_CHANNEL: &str = "bus.handler_error";
/// Console channel that records envelopes nobody handled
pub const UNHANDLED_CHANNEL: &str = "bus.unhandled";

/// Hooks installed by [`ChannelRouter::configure`].
#[derive(Clone, Default)]
pub struct BusHooks {
    pub get_binding: Option<BindingAccessor>,
    pub on_deliver: Option<PageCallback>,
}

impl BusHooks {
    pub fn new(get_binding: BindingAccessor, on_deliver: PageCallback) -> Self {
        Self {
            get_binding: Some(get_binding),
            on_deliver: Some(on_deliver),
        }
    }
}

/// Orchestrator status transition delivered to state subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub previous: OrchestratorStatus,
    pub status: OrchestratorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<SessionKey>,
    pub at: DateTime<Utc>,
}

struct HandlerSlot {
    key: Option<String>,
    handler: Handler,
}

pub struct ChannelRouter {
    hooks: RwLock<BusHooks>,
    handlers: DashMap<String, Vec<HandlerSlot>>,
    wire: WireLog,
    console_tx: broadcast::Sender<WireEntry>,
    state_tx: broadcast::Sender<StateChange>,
    status: Mutex<OrchestratorStatus>,
}

impl ChannelRouter {
    pub fn new(wire_capacity: usize, broadcast_capacity: usize) -> Self {
        let capacity = broadcast_capacity.max(1);
        let (console_tx, _) = broadcast::channel(capacity);
        let (state_tx, _) = broadcast::channel(capacity);
        Self {
            hooks: RwLock::new(BusHooks::default()),
            handlers: DashMap::new(),
            wire: WireLog::new(wire_capacity),
            console_tx,
            state_tx,
            status: Mutex::new(OrchestratorStatus::Idle),
        }
    }

    /// Install the binding accessor and page callback, replacing any previous ones.
    pub fn configure(&self, hooks: BusHooks) {
        *self.hooks.write().unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    fn hooks(&self) -> BusHooks {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn current_binding(&self) -> Option<Binding> {
        self.hooks().get_binding.and_then(|get| get())
    }

    /// Register a handler unconditionally. Registering twice means two invocations per envelope.
    pub fn register_handler(&self, channel: &str, handler: Handler) {
        self.handlers
            .entry(channel.to_string())
            .or_default()
            .push(HandlerSlot { key: None, handler });
    }

    /// Register a handler once per `(channel, registration_key)`.
    ///
    /// Returns `false` and keeps the existing handler when the key is already present.
    pub fn register_once(&self, channel: &str, registration_key: &str, handler: Handler) -> bool {
        let mut slots = self.handlers.entry(channel.to_string()).or_default();
        if slots
            .iter()
            .any(|s| s.key.as_deref() == Some(registration_key))
        {
            tracing::debug!(
                "handler {} already registered on {}, skipping",
                registration_key,
                channel
            );
            return false;
        }
        slots.push(HandlerSlot {
            key: Some(registration_key.to_string()),
            handler,
        });
        true
    }

    pub fn unregister(&self, channel: &str, registration_key: &str) -> bool {
        let Some(mut slots) = self.handlers.get_mut(channel) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|s| s.key.as_deref() != Some(registration_key));
        before != slots.len()
    }

    pub fn handler_count(&self, channel: &str) -> usize {
        self.handlers.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Dispatch an inbound envelope to every handler on its channel.
    ///
    /// Returns the number of handlers that completed without error.
    pub fn deliver(&self, envelope: Envelope) -> usize {
        let session_key = self.session_key_for(&envelope);
        let label = format!("{} -> {}", envelope.channel, party_name(envelope.to));
        self.wire
            .append(envelope.clone(), session_key.clone(), label)
            .broadcast(&self.console_tx);

        let handlers: Vec<(Option<String>, Handler)> = self
            .handlers
            .get(&envelope.channel)
            .map(|slots| {
                slots
                    .iter()
                    .map(|s| (s.key.clone(), s.handler.clone()))
                    .collect()
            })
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!("no handler for channel {}", envelope.channel);
            self.wire
                .append(
                    Envelope::new(
                        Party::Orchestrator,
                        Party::Console,
                        UNHANDLED_CHANNEL,
                        json!({ "channel": envelope.channel }),
                    ),
                    session_key,
                    format!("unhandled {}", envelope.channel),
                )
                .broadcast(&self.console_tx);
            return 0;
        }

        let mut succeeded = 0;
        for (key, handler) in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&envelope)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    succeeded += 1;
                    continue;
                }
                Ok(Err(e)) => json!({ "code": e.error_code(), "error": e.to_string() }),
                Err(panic) => json!({ "code": "HANDLER_PANIC", "error": panic_message(&panic) }),
            };
            tracing::warn!(
                "handler {:?} on channel {} failed: {}",
                key,
                envelope.channel,
                failure
            );
            self.send_to_console(
                HANDLER_ERROR_CHANNEL,
                json!({
                    "channel": envelope.channel,
                    "registrationKey": key,
                    "failure": failure,
                }),
                &format!("handler failed on {}", envelope.channel),
            );
        }
        succeeded
    }

    /// Deliver a payload to the page and record it on the wire.
    pub fn send_to_page(
        &self,
        channel: &str,
        payload: Value,
        metadata: Option<Value>,
        label: &str,
    ) -> Envelope {
        let mut envelope = Envelope::new(Party::Orchestrator, Party::Page, channel, payload);
        envelope.metadata = metadata;
        let session_key = self.session_key_for(&envelope);
        self.wire
            .append(envelope.clone(), session_key, label)
            .broadcast(&self.console_tx);

        if let Some(on_deliver) = self.hooks().on_deliver {
            let delivered = catch_unwind(AssertUnwindSafe(|| on_deliver(channel, &envelope)));
            if let Err(panic) = delivered {
                let message = panic_message(&panic);
                tracing::warn!("page callback panicked on {}: {}", channel, message);
                self.send_to_console(
                    HANDLER_ERROR_CHANNEL,
                    json!({ "channel": channel, "failure": { "code": "PAGE_CALLBACK_PANIC", "error": message } }),
                    &format!("page callback failed on {}", channel),
                );
            }
        } else {
            tracing::debug!("page delivery on {} with no page callback configured", channel);
        }
        envelope
    }

    /// Record a console-only envelope; console subscribers receive it as a wire entry.
    pub fn send_to_console(&self, channel: &str, payload: Value, label: &str) -> Envelope {
        let envelope = Envelope::new(Party::Orchestrator, Party::Console, channel, payload);
        let session_key = self.session_key_for(&envelope);
        self.wire
            .append(envelope.clone(), session_key, label)
            .broadcast(&self.console_tx);
        envelope
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<WireEntry> {
        self.console_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    pub fn status(&self) -> OrchestratorStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update the orchestrator status, notifying state subscribers when it changes.
    pub fn set_status(&self, status: OrchestratorStatus, session_key: Option<SessionKey>) -> bool {
        let previous = {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == status {
                return false;
            }
            std::mem::replace(&mut *current, status)
        };
        tracing::debug!("orchestrator status {:?} -> {:?}", previous, status);
        // no subscribers is fine
        let _ = self.state_tx.send(StateChange {
            previous,
            status,
            session_key,
            at: Utc::now(),
        });
        true
    }

    pub fn wire(&self) -> &WireLog {
        &self.wire
    }

    /// Session an envelope belongs to: explicit route/tab metadata, else the current binding.
    fn session_key_for(&self, envelope: &Envelope) -> Option<SessionKey> {
        match (envelope.metadata_str("route"), envelope.tab_id()) {
            (Some(route), Some(tab)) => Some(SessionKey {
                route: Route::new(route),
                tab_id: TabId::new(tab),
            }),
            _ => self.current_binding().map(|b| b.session_key()),
        }
    }
}

impl WireEntry {
    fn broadcast(self, tx: &broadcast::Sender<WireEntry>) {
        // lagging or absent console subscribers never affect dispatch
        let _ = tx.send(self);
    }
}

fn party_name(party: Party) -> &'static str {
    match party {
        Party::Page => "page",
        Party::Console => "console",
        Party::Backend => "backend",
        Party::Orchestrator => "orchestrator",
        Party::PersistentStore => "persistent-store",
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
