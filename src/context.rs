pub mod gate;
pub mod registry;
pub mod snapshot;

use crate::location::ComponentLocation;
use crate::signal::{Signal, SignalError};
use chrono::{DateTime, Utc};
use gate::CompletionGate;
use registry::{ChildRegistry, Removal};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tracing::{debug, error, trace};
use uuid::Uuid;

/// Outcome carried by the response signals: a value, no value, or the processing error.
pub type Response<E> = Result<Option<E>, EventError>;

/// The flow an event belongs to and the server that runs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct FlowIdentity {
    name: String,
    server_id: String,
}

impl FlowIdentity {
    pub fn new(name: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_id: server_id.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }
}

impl fmt::Display for FlowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.server_id)
    }
}

/// A processing failure delivered through a response signal.
///
/// Cloning is cheap and every clone refers to the same underlying error, so all observers
/// of a failed response see the identical error. Equality is identity.
#[derive(Clone)]
pub struct EventError(Arc<anyhow::Error>);

impl EventError {
    pub fn new<T>(error: T) -> Self
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::new(error)))
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<T>()
    }
}

impl From<anyhow::Error> for EventError {
    fn from(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl PartialEq for EventError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for EventError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("event context '{0}' has already received a response")]
    AlreadyResponded(String),

    #[error("event context '{0}' has already completed and cannot accept new children")]
    ParentCompleted(String),
}

struct ParentLink<E> {
    context: Weak<ContextInner<E>>,
    key: u64,
    id: String,
}

struct ContextInner<E> {
    id: String,
    correlation_id: String,
    root_id: String,
    flow: FlowIdentity,
    location: Option<ComponentLocation>,
    received_at: DateTime<Utc>,
    parent: Option<ParentLink<E>>,
    // Strong handle on the parent while this context is still pending. Taken exactly once,
    // on completion or detach.
    upstream: Mutex<Option<Arc<ContextInner<E>>>>,
    children: ChildRegistry,
    gated: bool,
    responded: AtomicBool,
    before_response: Signal<Response<E>>,
    response: Signal<Response<E>>,
    completion: Signal<()>,
}

impl<E> ContextInner<E> {
    fn take_upstream(&self) -> Option<Arc<ContextInner<E>>> {
        self.upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<E: Clone + Send + 'static> ContextInner<E> {
    fn release(&self, obligation: &'static str) {
        trace!(id = %self.id, obligation, "obligation released");
        if self.children.release() {
            self.complete();
        }
    }

    // Only the caller that settles the registry gets here. Walks up the tree in a loop,
    // completing each ancestor this completion settles.
    fn complete(&self) {
        let mut next = self.settle();
        while let Some(parent) = next {
            next = parent.settle();
        }
    }

    // Resolves this context's completion, then removes it from its parent. Returns the
    // parent if that removal settled it.
    fn settle(&self) -> Option<Arc<ContextInner<E>>> {
        debug!(id = %self.id, "event context completed");
        if let Err(err) = self.completion.resolve(()) {
            error!(id = %self.id, %err, "completion resolved more than once");
            debug_assert!(false, "completion for '{}' resolved more than once", self.id);
            return None;
        }

        let parent = self.take_upstream()?;
        let key = self.parent.as_ref()?.key;
        match parent.children.remove(key) {
            Removal::Settled => Some(parent),
            Removal::Removed => {
                trace!(id = %parent.id, key, "child completed");
                None
            }
            Removal::NotRegistered => {
                trace!(id = %parent.id, key, "detached child completed");
                None
            }
        }
    }
}

// A pending chain would otherwise drop one ancestor per stack frame.
impl<E> Drop for ContextInner<E> {
    fn drop(&mut self) {
        let mut next = self
            .upstream
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        while let Some(parent) = next {
            next = Arc::into_inner(parent).and_then(|inner| inner.take_upstream());
        }
    }
}

/// Builds root event contexts.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    flow: FlowIdentity,
    id: Option<String>,
    correlation_id: Option<String>,
    location: Option<ComponentLocation>,
    received_at: Option<DateTime<Utc>>,
    gate: Option<CompletionGate>,
}

impl ContextBuilder {
    pub fn new(flow: FlowIdentity) -> Self {
        Self {
            flow,
            id: None,
            correlation_id: None,
            location: None,
            received_at: None,
            gate: None,
        }
    }

    /// Uses an explicit id instead of a generated UUID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Defaults to the context id.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn location(mut self, location: ComponentLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn gate(mut self, gate: CompletionGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn build<E: Clone + Send + 'static>(self) -> EventContext<E> {
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id = self.correlation_id.unwrap_or_else(|| id.clone());
        // The response is always outstanding; a gate adds one more.
        let implicit = if self.gate.is_some() { 2 } else { 1 };

        let inner = Arc::new(ContextInner {
            root_id: id.clone(),
            id,
            correlation_id,
            flow: self.flow,
            location: self.location,
            received_at: self.received_at.unwrap_or_else(Utc::now),
            parent: None,
            upstream: Mutex::new(None),
            children: ChildRegistry::new(implicit),
            gated: self.gate.is_some(),
            responded: AtomicBool::new(false),
            before_response: Signal::new(),
            response: Signal::new(),
            completion: Signal::new(),
        });
        debug!(id = %inner.id, flow = %inner.flow, gated = inner.gated, "created event context");

        if let Some(gate) = self.gate {
            let owner = Arc::clone(&inner);
            gate.on_fire(move || owner.release("gate"));
        }

        EventContext { inner }
    }
}

/// The per-event node of an execution tree.
///
/// Each context exposes two outcomes:
/// - the **response** signal, resolved by [`EventContext::success`] or
///   [`EventContext::error`];
/// - the **completion** signal, resolved once the response is set, every registered child
///   has completed and the gate (if any) has fired.
///
/// A child keeps its parent alive until the child completes; the parent only holds the
/// child's registration, never the child itself. `EventContext` is a cheap handle and can
/// be cloned and sent across threads.
pub struct EventContext<E> {
    inner: Arc<ContextInner<E>>,
}

impl<E> Clone for EventContext<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + 'static> EventContext<E> {
    /// Creates a root context.
    pub fn create(flow: FlowIdentity, correlation_id: Option<String>) -> Self {
        let mut builder = ContextBuilder::new(flow);
        if let Some(correlation_id) = correlation_id {
            builder = builder.correlation_id(correlation_id);
        }
        builder.build()
    }

    /// Creates a root context whose completion also waits for `gate`.
    pub fn create_with_gate(
        flow: FlowIdentity,
        correlation_id: Option<String>,
        gate: CompletionGate,
    ) -> Self {
        let mut builder = ContextBuilder::new(flow).gate(gate);
        if let Some(correlation_id) = correlation_id {
            builder = builder.correlation_id(correlation_id);
        }
        builder.build()
    }

    /// Creates a child of `parent` and registers it in one step.
    pub fn child(parent: &Self) -> Result<Self, ContextError> {
        Self::child_with(parent, None, None)
    }

    /// Creates a child with its own location and/or correlation id. Missing values are
    /// inherited from the parent.
    ///
    /// Fails with [`ContextError::ParentCompleted`] if the parent has already completed.
    pub fn child_with(
        parent: &Self,
        location: Option<ComponentLocation>,
        correlation_id: Option<String>,
    ) -> Result<Self, ContextError> {
        let owner = &parent.inner;
        let key = owner.children.register().ok_or_else(|| {
            error!(id = %owner.id, "cannot register a child on a completed event context");
            ContextError::ParentCompleted(owner.id.clone())
        })?;

        let inner = Arc::new(ContextInner {
            id: format!("{}_{}", owner.id, key),
            correlation_id: correlation_id.unwrap_or_else(|| owner.correlation_id.clone()),
            root_id: owner.root_id.clone(),
            flow: owner.flow.clone(),
            location: location.or_else(|| owner.location.clone()),
            received_at: Utc::now(),
            parent: Some(ParentLink {
                context: Arc::downgrade(owner),
                key,
                id: owner.id.clone(),
            }),
            upstream: Mutex::new(Some(Arc::clone(owner))),
            children: ChildRegistry::new(1),
            gated: false,
            responded: AtomicBool::new(false),
            before_response: Signal::new(),
            response: Signal::new(),
            completion: Signal::new(),
        });

        debug!(id = %inner.id, parent = %owner.id, "registered child event context");
        Ok(Self { inner })
    }

    /// Completes processing with an optional result.
    pub fn success(&self, value: Option<E>) -> Result<(), ContextError> {
        self.respond(Ok(value))
    }

    /// Completes processing with a failure. The failure is only visible through this
    /// context's response; completion is still reached.
    pub fn error(&self, err: impl Into<EventError>) -> Result<(), ContextError> {
        self.respond(Err(err.into()))
    }

    #[tracing::instrument(name = "respond", level = "debug", skip_all, fields(id = %self.inner.id))]
    fn respond(&self, outcome: Response<E>) -> Result<(), ContextError> {
        if self.inner.responded.swap(true, Ordering::AcqRel) {
            error!("response already set");
            return Err(ContextError::AlreadyResponded(self.inner.id.clone()));
        }

        let already = |_: SignalError| ContextError::AlreadyResponded(self.inner.id.clone());
        self.inner
            .before_response
            .resolve(outcome.clone())
            .map_err(already)?;
        self.inner.response.resolve(outcome).map_err(already)?;

        self.inner.release("response");
        Ok(())
    }

    /// Resolves with the response, strictly before [`EventContext::response_signal`].
    pub fn before_response_signal(&self) -> Signal<Response<E>> {
        self.inner.before_response.clone()
    }

    pub fn response_signal(&self) -> Signal<Response<E>> {
        self.inner.response.clone()
    }

    pub fn completion_signal(&self) -> Signal<()> {
        self.inner.completion.clone()
    }

    /// Stops the parent from waiting on this context. This context's own signals are not
    /// touched. Returns `true` if a registration was actually removed.
    pub fn detach(&self) -> bool {
        let Some(link) = &self.inner.parent else {
            return false;
        };
        let Some(parent) = link.context.upgrade() else {
            return false;
        };

        match parent.children.remove(link.key) {
            Removal::NotRegistered => false,
            Removal::Removed => {
                debug!(id = %self.inner.id, parent = %link.id, "detached from parent");
                drop(self.inner.take_upstream());
                true
            }
            Removal::Settled => {
                debug!(id = %self.inner.id, parent = %link.id, "detached from parent, parent settled");
                drop(self.inner.take_upstream());
                parent.complete();
                true
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn correlation_id(&self) -> &str {
        &self.inner.correlation_id
    }

    /// Id of the root of the tree this context was forked from.
    pub fn root_id(&self) -> &str {
        &self.inner.root_id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.inner.parent.as_ref().map(|link| link.id.as_str())
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    pub fn flow(&self) -> &FlowIdentity {
        &self.inner.flow
    }

    pub fn flow_name(&self) -> &str {
        self.inner.flow.name()
    }

    pub fn server_id(&self) -> &str {
        self.inner.flow.server_id()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.inner.received_at
    }

    pub fn originating_location(&self) -> Option<&ComponentLocation> {
        self.inner.location.as_ref()
    }

    pub fn originating_connector_name(&self) -> Option<&str> {
        self.inner.location.as_ref().map(|l| l.connector_name())
    }

    pub fn originating_source_name(&self) -> Option<&str> {
        self.inner.location.as_ref().map(|l| l.source_name())
    }

    pub fn is_gated(&self) -> bool {
        self.inner.gated
    }

    pub fn is_response_done(&self) -> bool {
        self.inner.response.is_resolved()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.completion.is_resolved()
    }

    /// Number of registered children that have not completed or detached.
    pub fn child_count(&self) -> usize {
        self.inner.children.len()
    }
}

fn state_label(done: bool) -> &'static str {
    if done { "done" } else { "pending" }
}

impl<E: Clone + Send + 'static> fmt::Display for EventContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [flow: {}, correlation: {}, response: {}, completion: {}]",
            self.inner.id,
            self.inner.flow,
            self.inner.correlation_id,
            state_label(self.is_response_done()),
            state_label(self.is_complete()),
        )
    }
}

impl<E: Clone + Send + 'static> fmt::Debug for EventContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("id", &self.inner.id)
            .field("correlation_id", &self.inner.correlation_id)
            .field("parent", &self.parent_id())
            .field("children", &self.child_count())
            .field("outstanding", &self.inner.children.outstanding())
            .field("response", &state_label(self.is_response_done()))
            .field("completion", &state_label(self.is_complete()))
            .finish()
    }
}
