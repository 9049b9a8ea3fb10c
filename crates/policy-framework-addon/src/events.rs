use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use tracing::warn;

pub const REASON_SPEC_SYNC: &str = "PolicySpecSync";
pub const REASON_TEMPLATE_SYNC: &str = "PolicyTemplateSync";

/// Reason carried by compliance events for one template; the status-sync
/// side turns these into history.
pub fn compliance_reason(namespace: Option<&str>, template_name: &str) -> String {
    match namespace {
        Some(ns) => format!("policy: {}/{}", ns, template_name),
        None => format!("policy: {}", template_name),
    }
}

/// Notification sink. Emitting is best-effort and never fails a reconcile.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, target: &ObjectReference, type_: EventType, reason: &str, message: &str);
}

pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn emit(&self, target: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(message.into()),
            action: reason.into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, target).await {
            warn!(error = ?e, reason, "failed to publish event");
        }
    }
}
