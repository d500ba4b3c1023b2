//! Hook dispatch: synchronous lifecycle/data interception points.
//!
//! Listeners run in-process in registration order; they are extensions in
//! the same trust domain, so panics are not caught. Hooks fire on success
//! and on failure alike — AFTER stages carry error details when a step
//! failed.

use std::sync::{Arc, RwLock};

use serde_json::Value;

use batchflow_types::hook::HookStage;

/// Payload handed to hook listeners.
#[derive(Debug, Clone)]
pub struct HookPayload {
    pub stage: HookStage,
    pub pipeline: String,
    pub step_key: Option<String>,
    pub data: Value,
}

impl HookPayload {
    pub fn new(stage: HookStage, pipeline: impl Into<String>, data: Value) -> Self {
        Self {
            stage,
            pipeline: pipeline.into(),
            step_key: None,
            data,
        }
    }

    #[must_use]
    pub fn for_step(mut self, step_key: impl Into<String>) -> Self {
        self.step_key = Some(step_key.into());
        self
    }
}

type Listener = Arc<dyn Fn(&HookPayload) + Send + Sync>;

/// Dispatches hook payloads to registered listeners, synchronously.
#[derive(Default)]
pub struct HookDispatcher {
    listeners: RwLock<Vec<(Option<HookStage>, Listener)>>,
}

impl HookDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to one specific stage.
    pub fn on(&self, stage: HookStage, listener: impl Fn(&HookPayload) + Send + Sync + 'static) {
        self.push(Some(stage), Arc::new(listener));
    }

    /// Listen to every stage.
    pub fn on_any(&self, listener: impl Fn(&HookPayload) + Send + Sync + 'static) {
        self.push(None, Arc::new(listener));
    }

    fn push(&self, stage: Option<HookStage>, listener: Listener) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push((stage, listener)),
            Err(poisoned) => poisoned.into_inner().push((stage, listener)),
        }
    }

    /// Fire a payload to all matching listeners.
    pub fn fire(&self, payload: &HookPayload) {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (stage, listener) in listeners.iter() {
            if stage.is_none() || *stage == Some(payload.stage) {
                listener(payload);
            }
        }
    }
}

/// Test helper: collects every fired payload.
#[derive(Default, Clone)]
pub struct CollectingListener {
    payloads: Arc<std::sync::Mutex<Vec<HookPayload>>>,
}

impl CollectingListener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register this collector on every stage of the dispatcher.
    pub fn attach(&self, dispatcher: &HookDispatcher) {
        let payloads = self.payloads.clone();
        dispatcher.on_any(move |payload| {
            let mut guard = match payloads.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.push(payload.clone());
        });
    }

    #[must_use]
    pub fn stages(&self) -> Vec<HookStage> {
        self.snapshot().iter().map(|p| p.stage).collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<HookPayload> {
        match self.payloads.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn stage_scoped_listener_only_sees_its_stage() {
        let dispatcher = HookDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        dispatcher.on(HookStage::OnError, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.fire(&HookPayload::new(HookStage::OnError, "p", json!({})));
        dispatcher.fire(&HookPayload::new(HookStage::AfterLoad, "p", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_any_sees_everything_in_order() {
        let dispatcher = HookDispatcher::new();
        let collector = CollectingListener::new();
        collector.attach(&dispatcher);

        dispatcher.fire(&HookPayload::new(HookStage::PipelineStarted, "p", json!({})));
        dispatcher.fire(
            &HookPayload::new(HookStage::BeforeExtract, "p", json!({"inputCount": 3}))
                .for_step("extract"),
        );
        dispatcher.fire(&HookPayload::new(HookStage::PipelineCompleted, "p", json!({})));

        assert_eq!(
            collector.stages(),
            vec![
                HookStage::PipelineStarted,
                HookStage::BeforeExtract,
                HookStage::PipelineCompleted
            ]
        );
        let payloads = collector.snapshot();
        assert_eq!(payloads[1].step_key.as_deref(), Some("extract"));
        assert_eq!(payloads[1].data["inputCount"], json!(3));
    }

    #[test]
    fn example_payload_catalog_drives_hook_testing() {
        let dispatcher = HookDispatcher::new();
        let collector = CollectingListener::new();
        collector.attach(&dispatcher);

        for stage in HookStage::ALL {
            dispatcher.fire(&HookPayload::new(stage, "order-sync", stage.example_payload()));
        }
        assert_eq!(collector.stages().len(), HookStage::ALL.len());
    }
}
