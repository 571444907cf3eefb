//! Event-collecting processor plugin for assertions in tests

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::flow::FlowRecord;
use crate::plugin::{EventKind, ProcessorPlugin};
use crate::FlowDigest;

/// One recorded flow event
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub kind: EventKind,
    pub digest: FlowDigest,
    /// DNS hint carried by the flow at event time
    pub dns_host_name: String,
}

/// Processor plugin that records the flow event stream
#[derive(Default)]
pub struct EventCollector {
    events: Mutex<Vec<RecordedEvent>>,
}

impl EventCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, kind: EventKind, flow: &Arc<FlowRecord>) {
        let dns_host_name = flow.detection.read().dns_host_name.clone();
        self.events.lock().push(RecordedEvent {
            kind,
            digest: flow.digest,
            dns_host_name,
        });
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Event kinds recorded for one flow, in order
    pub fn kinds_for(&self, digest: &FlowDigest) -> Vec<EventKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.digest == *digest)
            .map(|e| e.kind)
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ProcessorPlugin for EventCollector {
    fn name(&self) -> &str {
        "event-collector"
    }

    fn on_flow_new(&self, flow: &Arc<FlowRecord>) {
        self.record(EventKind::FlowNew, flow);
    }

    fn on_flow_dpi_update(&self, flow: &Arc<FlowRecord>) {
        self.record(EventKind::FlowDpiUpdate, flow);
    }

    fn on_flow_dpi_complete(&self, flow: &Arc<FlowRecord>) {
        self.record(EventKind::FlowDpiComplete, flow);
    }

    fn on_flow_expiring(&self, flow: &Arc<FlowRecord>) {
        self.record(EventKind::FlowExpiring, flow);
    }

    fn on_flow_expire(&self, flow: &Arc<FlowRecord>) {
        self.record(EventKind::FlowExpire, flow);
    }
}
