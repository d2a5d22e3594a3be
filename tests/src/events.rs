use hotswap_kernel::{EventSink, LifecycleEvent};
use parking_lot::Mutex;
use std::sync::Arc;

/// Event sink that keeps everything it receives.
#[derive(Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Event names in publication order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(LifecycleEvent::name).collect()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn broadcast(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}
