//! Composition root: owns the bus, bindings, selection store and run supervisor, and registers
//! the built-in command handlers.

use crate::backend::{BackendRequest, BackendTransport, HttpBackend};
use crate::bus::{BusHooks, ChannelRouter, Handler, PageCallback, StateChange, WireEntry};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::ProgressThrottle;
use crate::session::{Binding, BindingRegistry, InMemorySelectionStore, SelectionStore};
use crate::supervisor::{RunRequest, RunSettings, RunSupervisor};
use crate::types::envelope::{Envelope, RequestEvent};
use crate::types::ids::{PageInstanceId, Route, RunId, SessionKey, TabId};
use crate::types::input::{
    channels, parse_command, ActivateTab, BindTab, RequestCommand, StartRun,
};
use serde_json::{json, Map, Value};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::broadcast;

/// Registration key of the built-in handlers
const HANDLER_KEY: &str = "orchestrator";

struct Inner {
    config: OrchestratorConfig,
    bus: Arc<ChannelRouter>,
    bindings: Arc<BindingRegistry>,
    current_tab: Arc<RwLock<Option<TabId>>>,
    selections: Arc<dyn SelectionStore>,
    transport: Arc<dyn BackendTransport>,
    supervisor: RunSupervisor,
}

/// One orchestrator per process; cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn BackendTransport>,
        selections: Arc<dyn SelectionStore>,
    ) -> Self {
        let bus = Arc::new(ChannelRouter::new(
            config.wire_capacity,
            config.broadcast_capacity,
        ));
        let supervisor = RunSupervisor::new(
            bus.clone(),
            transport.clone(),
            ProgressThrottle::new(config.progress_min_interval()),
            RunSettings::from(&config),
        );
        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                bindings: Arc::new(BindingRegistry::new()),
                current_tab: Arc::new(RwLock::new(None)),
                selections,
                transport,
                supervisor,
            }),
        }
    }

    /// HTTP backend with an in-memory selection store.
    pub fn with_http_backend(config: OrchestratorConfig) -> Result<Self> {
        let transport = Arc::new(HttpBackend::new(config.excerpt_limit)?);
        Ok(Self::new(
            config,
            transport,
            Arc::new(InMemorySelectionStore::new()),
        ))
    }

    /// Install the page callback and the built-in handlers.
    ///
    /// Safe to call again (hot reinitialisation): the callback is replaced and handlers are
    /// registered once per channel.
    pub fn configure(&self, on_deliver: PageCallback) {
        let bindings = self.inner.bindings.clone();
        let current_tab = self.inner.current_tab.clone();
        let get_binding = Arc::new(move || {
            let tab = current_tab
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()?;
            bindings.lookup(&tab)
        });
        self.inner
            .bus
            .configure(BusHooks::new(get_binding, on_deliver));

        let weak = Arc::downgrade(&self.inner);
        let handlers: [(&str, Handler); 6] = [
            (
                channels::RUN_START,
                command_handler(weak.clone(), |o, env| {
                    let command: StartRun = parse_command(env)?;
                    o.start_run(env.tab_id(), command).map(|_| ())
                }),
            ),
            (
                channels::RUN_STOP,
                command_handler(weak.clone(), |o, env| {
                    o.stop_run(env.tab_id()).map(|_| ())
                }),
            ),
            (
                channels::SELECTION_UPDATE,
                command_handler(weak.clone(), |o, env| {
                    o.update_selection(env.tab_id(), env.payload.clone())
                }),
            ),
            (
                channels::REQUEST,
                command_handler(weak.clone(), |o, env| {
                    let command: RequestCommand = parse_command(env)?;
                    o.spawn_request(env.tab_id(), command)
                }),
            ),
            (
                channels::TAB_BIND,
                command_handler(weak.clone(), |o, env| {
                    let command: BindTab = parse_command(env)?;
                    o.bind_tab(&TabId::new(command.tab_id), &Route::new(command.route));
                    Ok(())
                }),
            ),
            (
                channels::TAB_ACTIVATE,
                command_handler(weak, |o, env| {
                    let command: ActivateTab = parse_command(env)?;
                    o.activate_tab(&TabId::new(command.tab_id)).map(|_| ())
                }),
            ),
        ];
        for (channel, handler) in handlers {
            self.inner.bus.register_once(channel, HANDLER_KEY, handler);
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &Arc<ChannelRouter> {
        &self.inner.bus
    }

    pub fn supervisor(&self) -> &RunSupervisor {
        &self.inner.supervisor
    }

    pub fn bindings(&self) -> &BindingRegistry {
        &self.inner.bindings
    }

    /// Dispatch an inbound envelope through the bus.
    pub fn deliver(&self, envelope: Envelope) -> usize {
        self.inner.bus.deliver(envelope)
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<WireEntry> {
        self.inner.bus.subscribe_console()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.inner.bus.subscribe_state()
    }

    pub fn current_binding(&self) -> Option<Binding> {
        self.inner.bus.current_binding()
    }

    /// Bind a tab, make it current and restore its stored selection to the page.
    pub fn bind_tab(&self, tab_id: &TabId, route: &Route) -> PageInstanceId {
        let page_instance_id = self.inner.bindings.bind(tab_id, route);
        self.set_current_tab(tab_id);

        let key = SessionKey {
            route: route.clone(),
            tab_id: tab_id.clone(),
        };
        if let Some(selection) = self.inner.selections.load(&key) {
            tracing::debug!("restoring selection for {}", key);
            self.inner.bus.send_to_page(
                channels::SELECTION_RESTORE,
                selection,
                Some(json!({
                    "route": route,
                    "tabId": tab_id,
                    "pageInstanceId": page_instance_id,
                })),
                "restore selection",
            );
        }
        page_instance_id
    }

    /// Make an already bound tab the current one.
    pub fn activate_tab(&self, tab_id: &TabId) -> Result<Binding> {
        let binding = self
            .inner
            .bindings
            .lookup(tab_id)
            .ok_or_else(|| OrchestratorError::Binding(format!("tab {} is not bound", tab_id)))?;
        self.set_current_tab(tab_id);
        Ok(binding)
    }

    fn set_current_tab(&self, tab_id: &TabId) {
        *self
            .inner
            .current_tab
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(tab_id.clone());
    }

    /// Binding of `tab`, or the current binding when no tab is named.
    pub fn resolve_binding(&self, tab: Option<&str>) -> Result<Binding> {
        match tab {
            Some(tab) => self
                .inner
                .bindings
                .lookup(&TabId::new(tab))
                .ok_or_else(|| OrchestratorError::Binding(format!("tab {} is not bound", tab))),
            None => self
                .current_binding()
                .ok_or_else(|| OrchestratorError::Binding("no current tab".to_string())),
        }
    }

    /// Start a streaming run for the resolved session, superseding any active one.
    pub fn start_run(&self, tab: Option<&str>, command: StartRun) -> Result<RunId> {
        let binding = self.resolve_binding(tab)?;
        let key = binding.session_key();
        let run_id = RunId::random();

        let context = if command.include_selection {
            self.inner.selections.load(&key)
        } else {
            None
        };
        let body = backend_body(
            &binding,
            json!({ "runId": run_id, "sink": command.sink }),
            command.body,
            context,
        );
        let url = self.inner.config.resolve_endpoint(&command.endpoint);

        self.inner.supervisor.start(RunRequest {
            session_key: key,
            run_id,
            sink: command.sink,
            request: BackendRequest::new(url, body),
        })
    }

    pub fn stop_run(&self, tab: Option<&str>) -> Result<bool> {
        let binding = self.resolve_binding(tab)?;
        Ok(self.inner.supervisor.stop(&binding.session_key()))
    }

    /// Abort every active run.
    pub fn shutdown(&self) -> usize {
        self.inner.supervisor.stop_all()
    }

    pub fn update_selection(&self, tab: Option<&str>, selection: Value) -> Result<()> {
        let binding = self.resolve_binding(tab)?;
        self.inner
            .selections
            .save(&binding.session_key(), selection);
        Ok(())
    }

    /// Run the request flow on a spawned task; the binding is resolved up front.
    fn spawn_request(&self, tab: Option<&str>, command: RequestCommand) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| OrchestratorError::Runtime(e.to_string()))?;
        let binding = self.resolve_binding(tab)?;
        let orchestrator = self.clone();
        runtime.spawn(async move {
            // outcome already delivered to the page
            let _ = orchestrator
                .request(Some(binding.tab_id.as_str()), command)
                .await;
        });
        Ok(())
    }

    /// Non-streaming request/response flow.
    ///
    /// The page receives `metadata.event = started`, then `success` with the response body or
    /// `error` with code and message.
    pub async fn request(&self, tab: Option<&str>, command: RequestCommand) -> Result<Value> {
        let binding = self.resolve_binding(tab)?;
        let request_id = RunId::random();
        let channel = command
            .channel
            .clone()
            .unwrap_or_else(|| channels::REQUEST.to_string());
        let metadata = |event: RequestEvent| {
            json!({
                "event": event,
                "requestId": request_id,
                "route": binding.route,
                "tabId": binding.tab_id,
            })
        };
        let bus = &self.inner.bus;

        bus.send_to_page(
            &channel,
            json!({ "endpoint": command.endpoint }),
            Some(metadata(RequestEvent::Started)),
            &format!("request {} started", command.endpoint),
        );

        let body = backend_body(
            &binding,
            json!({ "requestId": request_id }),
            command.body,
            None,
        );
        let url = self.inner.config.resolve_endpoint(&command.endpoint);
        match self
            .inner
            .transport
            .post_json(&BackendRequest::new(url, body))
            .await
        {
            Ok(response) => {
                bus.send_to_page(
                    &channel,
                    response.clone(),
                    Some(metadata(RequestEvent::Success)),
                    &format!("request {} succeeded", command.endpoint),
                );
                Ok(response)
            }
            Err(e) => {
                tracing::warn!("request {} failed: {}", command.endpoint, e);
                bus.send_to_page(
                    &channel,
                    json!({
                        "code": e.error_code(),
                        "message": e.to_string(),
                        "details": e.to_error_details(),
                    }),
                    Some(metadata(RequestEvent::Error)),
                    &format!("request {} failed", command.endpoint),
                );
                Err(e)
            }
        }
    }

    /// A command with no resolvable binding is dropped with a console-only note.
    fn absorb_binding_error(&self, envelope: &Envelope, result: Result<()>) -> Result<()> {
        match result {
            Err(OrchestratorError::Binding(reason)) => {
                tracing::debug!("rejected {}: {}", envelope.channel, reason);
                self.inner.bus.send_to_console(
                    channels::CONSOLE_NOTE,
                    json!({ "channel": envelope.channel, "note": reason }),
                    &format!("{} rejected: no binding", envelope.channel),
                );
                Ok(())
            }
            other => other,
        }
    }
}

fn command_handler<F>(inner: Weak<Inner>, f: F) -> Handler
where
    F: Fn(&Orchestrator, &Envelope) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |envelope: &Envelope| {
        let Some(inner) = inner.upgrade() else {
            return Ok(());
        };
        let orchestrator = Orchestrator { inner };
        let result = f(&orchestrator, envelope);
        orchestrator.absorb_binding_error(envelope, result)
    })
}

/// `{ tab_id, ...body, context?, metadata: { ...body.metadata, ...extra, pageInstanceId, route } }`
///
/// A body that is not a JSON object is sent as `payload`.
fn backend_body(
    binding: &Binding,
    extra_metadata: Value,
    body: Value,
    context: Option<Value>,
) -> Value {
    let mut out = Map::new();
    out.insert("tab_id".to_string(), json!(binding.tab_id));
    match body {
        Value::Object(fields) => out.extend(fields),
        Value::Null => {}
        other => {
            out.insert("payload".to_string(), other);
        }
    }
    if let Some(context) = context {
        out.insert("context".to_string(), context);
    }

    let mut metadata = match out.remove("metadata") {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    if let Value::Object(extra) = extra_metadata {
        metadata.extend(extra);
    }
    metadata.insert("pageInstanceId".to_string(), json!(binding.page_instance_id));
    metadata.insert("route".to_string(), json!(binding.route));
    out.insert("metadata".to_string(), Value::Object(metadata));
    Value::Object(out)
}
