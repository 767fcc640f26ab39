use crate::signal::{Signal, SignalError};

/// An extra condition that must fire before a context is considered complete.
///
/// The gate behaves like an implicit child of every context created with it: the context
/// may have responded and all of its children may be done, but completion waits until the
/// gate fires. One gate can be shared by several contexts.
#[derive(Debug, Clone, Default)]
pub struct CompletionGate {
    signal: Signal<()>,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the gate. A gate fires once; firing again is an error.
    pub fn fire(&self) -> Result<(), SignalError> {
        self.signal.resolve(())
    }

    pub fn is_fired(&self) -> bool {
        self.signal.is_resolved()
    }

    pub fn signal(&self) -> &Signal<()> {
        &self.signal
    }

    pub(crate) fn on_fire<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.signal.subscribe(move |_| callback());
    }
}

impl From<Signal<()>> for CompletionGate {
    fn from(signal: Signal<()>) -> Self {
        Self { signal }
    }
}
