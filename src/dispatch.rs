//! Fan-out delivery of one message to every target
//!
//! Each target is driven by its own tokio task with its own retry loop, so
//! a slow or failing sink never delays, blocks or cancels delivery to any
//! other. [`deliver`] returns once every target has reached a terminal
//! outcome; partial success is reported, not raised.

use crate::message::Message;
use crate::retry::{with_retry, RetryPolicy};
use crate::sink::{Sink, TargetKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A configured destination: a sink plus its retry policy
pub struct DeliveryTarget {
    id: String,
    sink: Arc<dyn Sink>,
    retry: RetryPolicy,
}

impl DeliveryTarget {
    pub fn new(id: impl Into<String>, sink: Arc<dyn Sink>, retry: RetryPolicy) -> Self {
        Self {
            id: id.into(),
            sink,
            retry,
        }
    }

    /// Identity used as the key in a [`DeliveryReport`]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TargetKind {
        self.sink.kind()
    }

    pub fn endpoint(&self) -> String {
        self.sink.endpoint()
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

impl std::fmt::Debug for DeliveryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTarget")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

/// Where a delivery to one target stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Succeeded,
    Exhausted,
}

/// Delivery record for one (message, target) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryAttempt {
    pub target_id: String,
    pub kind: TargetKind,
    pub attempt_number: u32,
    pub last_error: Option<String>,
    pub outcome: AttemptOutcome,
}

impl DeliveryAttempt {
    fn pending(target: &DeliveryTarget) -> Self {
        Self {
            target_id: target.id.clone(),
            kind: target.kind(),
            attempt_number: 0,
            last_error: None,
            outcome: AttemptOutcome::Pending,
        }
    }
}

/// Terminal outcome per target for one message
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    attempts: BTreeMap<String, DeliveryAttempt>,
}

impl DeliveryReport {
    pub fn get(&self, target_id: &str) -> Option<&DeliveryAttempt> {
        self.attempts.get(target_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeliveryAttempt> {
        self.attempts.values()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &DeliveryAttempt> {
        self.iter()
            .filter(|a| a.outcome == AttemptOutcome::Succeeded)
    }

    pub fn exhausted(&self) -> impl Iterator<Item = &DeliveryAttempt> {
        self.iter()
            .filter(|a| a.outcome == AttemptOutcome::Exhausted)
    }

    /// True when every target succeeded
    pub fn all_succeeded(&self) -> bool {
        self.iter().all(|a| a.outcome == AttemptOutcome::Succeeded)
    }

    fn insert(&mut self, attempt: DeliveryAttempt) {
        self.attempts.insert(attempt.target_id.clone(), attempt);
    }
}

/// Deliver `message` to every target concurrently
pub async fn deliver(
    message: Arc<Message>,
    targets: &[Arc<DeliveryTarget>],
    cancel: &CancellationToken,
) -> DeliveryReport {
    let handles: Vec<(Arc<DeliveryTarget>, JoinHandle<DeliveryAttempt>)> = targets
        .iter()
        .map(|target| {
            let handle = tokio::spawn(deliver_one(
                target.clone(),
                message.clone(),
                cancel.clone(),
            ));
            (target.clone(), handle)
        })
        .collect();

    let mut report = DeliveryReport::default();
    for (target, handle) in handles {
        let attempt = match handle.await {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::error!(target_id = %target.id, error = %e, "Delivery task failed");
                DeliveryAttempt {
                    last_error: Some(format!("delivery task failed: {}", e)),
                    outcome: AttemptOutcome::Exhausted,
                    ..DeliveryAttempt::pending(&target)
                }
            }
        };
        report.insert(attempt);
    }
    report
}

async fn deliver_one(
    target: Arc<DeliveryTarget>,
    message: Arc<Message>,
    cancel: CancellationToken,
) -> DeliveryAttempt {
    let mut attempt = DeliveryAttempt::pending(&target);

    let report = with_retry(&target.retry, &cancel, &target.id, |_| {
        let sink = target.sink.clone();
        let message = message.clone();
        async move { sink.send(&message).await }
    })
    .await;

    attempt.attempt_number = report.attempts;
    match report.result {
        Ok(()) => {
            attempt.outcome = AttemptOutcome::Succeeded;
            tracing::info!(
                target_id = %target.id,
                kind = %target.kind(),
                attempts = report.attempts,
                "Delivered"
            );
        }
        Err(e) => {
            attempt.outcome = AttemptOutcome::Exhausted;
            attempt.last_error = Some(e.to_string());
            tracing::error!(
                target_id = %target.id,
                kind = %target.kind(),
                endpoint = %target.endpoint(),
                attempts = report.attempts,
                error = %e,
                "Delivery exhausted"
            );
        }
    }
    attempt
}

/// Holds the configured targets and the shutdown token
pub struct Dispatcher {
    targets: Vec<Arc<DeliveryTarget>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(targets: Vec<DeliveryTarget>, cancel: CancellationToken) -> Self {
        Self {
            targets: targets.into_iter().map(Arc::new).collect(),
            cancel,
        }
    }

    pub fn targets(&self) -> &[Arc<DeliveryTarget>] {
        &self.targets
    }

    /// Deliver and wait for every target to finish
    pub async fn deliver(&self, message: Arc<Message>) -> DeliveryReport {
        deliver(message, &self.targets, &self.cancel).await
    }

    /// Deliver in the background; the caller does not wait
    pub fn spawn(self: &Arc<Self>, message: Arc<Message>) -> JoinHandle<DeliveryReport> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let report = dispatcher.deliver(message).await;
            let failed = report.exhausted().count();
            if failed == 0 {
                tracing::info!(targets = report.len(), "Message delivered to all targets");
            } else {
                tracing::warn!(
                    targets = report.len(),
                    failed,
                    "Message delivered with failures"
                );
            }
            report
        })
    }
}
