use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::anthropic::MessageSender;
use crate::escalation::EscalationExecutor;
use crate::prompt::{CorrectionTask, PromptError, Strictness, build_prompt};
use crate::state_machine::WorkItem;
use crate::store::{StoreError, WorkItemStore};
use crate::validator::Validator;

/// Drives one claimed work item through escalation and commits the outcome.
///
/// Only store failures escape: escalation exhaustion is committed as Failed,
/// missing input as Skipped. On a store failure the item is released back to
/// Pending when possible, otherwise the stuck reclaimer picks it up later.
pub struct CorrectionProcessor<S, C> {
    store: Arc<S>,
    executor: Arc<EscalationExecutor<C>>,
}

impl<S, C> Clone for CorrectionProcessor<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
        }
    }
}

impl<S: WorkItemStore, C: MessageSender> CorrectionProcessor<S, C> {
    pub fn new(store: Arc<S>, executor: Arc<EscalationExecutor<C>>) -> Self {
        Self { store, executor }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn executor(&self) -> &EscalationExecutor<C> {
        &self.executor
    }

    /// Processes an item already in Processing. Returns the committed item.
    pub async fn process(
        &self,
        item: &WorkItem,
        start_tier: Option<usize>,
    ) -> Result<WorkItem, StoreError> {
        let task = CorrectionTask::from_item(item);

        if let Err(PromptError::MissingInput { .. }) = build_prompt(&task, Strictness::Relaxed) {
            warn!(id = %item.id, subject = %item.subject_key, "skipping item without input data");
            return self.commit(&item.id, |store| store.skip(&item.id, "missing input data"));
        }

        match self.executor.execute(&task, start_tier).await {
            Ok(outcome) if Validator::is_no_changes(&outcome.result) => {
                let reason = outcome
                    .result
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("model reported no changes")
                    .to_string();
                info!(id = %item.id, tier = %outcome.tier_used, "no changes needed");
                self.commit(&item.id, |store| store.mark_no_changes(&item.id, &reason))
            }
            Ok(outcome) => {
                let result = json!({
                    "data": outcome.result,
                    "escalation": outcome.summary(),
                });
                self.commit(&item.id, |store| store.complete(&item.id, result))
            }
            Err(e) => {
                warn!(id = %item.id, subject = %item.subject_key, error = %e, "correction failed");
                let message = e.to_string();
                self.commit(&item.id, |store| store.fail(&item.id, &message))
            }
        }
    }

    fn commit(
        &self,
        id: &str,
        op: impl FnOnce(&S) -> Result<WorkItem, StoreError>,
    ) -> Result<WorkItem, StoreError> {
        match op(self.store.as_ref()) {
            Ok(item) => Ok(item),
            Err(e) => {
                error!(id, error = %e, "failed to commit outcome");
                if let Err(release_err) = self.store.release(id) {
                    warn!(id, error = %release_err, "could not release item; left for reclaim");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    use super::*;
    use crate::anthropic::types::{ContentBlock, Usage};
    use crate::anthropic::{AnthropicError, MessagesRequest, MessagesResponse};
    use crate::escalation::{RetryConfig, default_tiers};
    use crate::state_machine::{Batch, BatchSummary, CorrectionType, NewWorkItem, WorkStatus};
    use crate::store::{InMemoryStore, ItemFilter};

    struct FixedClient {
        text: String,
        calls: AtomicUsize,
    }

    impl FixedClient {
        fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl MessageSender for FixedClient {
        async fn send_message(
            &self,
            req: &MessagesRequest,
        ) -> Result<MessagesResponse, AnthropicError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MessagesResponse {
                id: "mock".into(),
                content: vec![ContentBlock {
                    content_type: "text".into(),
                    text: self.text.clone(),
                }],
                model: req.model.clone(),
                stop_reason: Some("end_turn".into()),
                usage: Usage::default(),
            })
        }
    }

    fn processor<S: WorkItemStore>(store: Arc<S>, reply: &str) -> CorrectionProcessor<S, FixedClient> {
        let executor = EscalationExecutor::new(
            FixedClient::new(reply),
            default_tiers(),
            RetryConfig { max_attempts: 1, base_delay_ms: 0 },
            Validator::default(),
        );
        CorrectionProcessor::new(store, Arc::new(executor))
    }

    fn claimed(store: &InMemoryStore, payload: Value) -> WorkItem {
        let item = store.create("golf-gti", CorrectionType::Title, payload).unwrap();
        store.claim(&item.id).unwrap()
    }

    #[tokio::test]
    async fn valid_output_completes_with_escalation_summary() {
        let store = Arc::new(InMemoryStore::new());
        let item = claimed(&store, json!({"title": "Golf"}));
        let p = processor(store.clone(), r#"{"title": "Volkswagen Golf GTI 2.0 TSI"}"#);

        let done = p.process(&item, None).await.unwrap();
        assert_eq!(done.status, WorkStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result["data"]["title"], "Volkswagen Golf GTI 2.0 TSI");
        assert_eq!(result["escalation"]["tier_used"], "standard");
        assert_eq!(result["escalation"]["escalated"], false);
    }

    #[tokio::test]
    async fn exhausted_chain_commits_failed_with_error() {
        let store = Arc::new(InMemoryStore::new());
        let item = claimed(&store, json!({"title": "Golf"}));
        let p = processor(store.clone(), r#"{"title": "Golf Standard"}"#);

        let done = p.process(&item, None).await.unwrap();
        assert_eq!(done.status, WorkStatus::Failed);
        let err = done.last_error.unwrap();
        assert!(err.contains("exhausted after 3 tier(s)"), "{err}");
        assert_eq!(p.executor().tiers().len(), 3);
    }

    #[tokio::test]
    async fn no_changes_answer_marks_item() {
        let store = Arc::new(InMemoryStore::new());
        let item = claimed(&store, json!({"title": "Golf GTI"}));
        let p = processor(store.clone(), r#"{"no_changes": true, "reason": "title is accurate"}"#);

        let done = p.process(&item, None).await.unwrap();
        assert_eq!(done.status, WorkStatus::NoChanges);
        assert_eq!(done.result.unwrap()["reason"], "title is accurate");
    }

    #[tokio::test]
    async fn missing_input_is_skipped_without_calling_api() {
        let store = Arc::new(InMemoryStore::new());
        let item = claimed(&store, json!({}));
        let p = processor(store.clone(), "{}");

        let done = p.process(&item, None).await.unwrap();
        assert_eq!(done.status, WorkStatus::Skipped);
        assert_eq!(p.executor().client().calls.load(Ordering::SeqCst), 0);
    }

    /// Store whose terminal writes fail, to exercise the release path.
    struct BrokenCommitStore {
        inner: InMemoryStore,
    }

    impl WorkItemStore for BrokenCommitStore {
        fn now(&self) -> DateTime<Utc> {
            self.inner.now()
        }
        fn create_with(&self, new: NewWorkItem) -> Result<WorkItem, StoreError> {
            self.inner.create_with(new)
        }
        fn claim_next_pending(&self, t: CorrectionType, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
            self.inner.claim_next_pending(t, limit)
        }
        fn claim(&self, id: &str) -> Result<WorkItem, StoreError> {
            self.inner.claim(id)
        }
        fn release(&self, id: &str) -> Result<WorkItem, StoreError> {
            self.inner.release(id)
        }
        fn complete(&self, _id: &str, _result: Value) -> Result<WorkItem, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
        fn fail(&self, id: &str, error: &str) -> Result<WorkItem, StoreError> {
            self.inner.fail(id, error)
        }
        fn skip(&self, id: &str, reason: &str) -> Result<WorkItem, StoreError> {
            self.inner.skip(id, reason)
        }
        fn mark_no_changes(&self, id: &str, reason: &str) -> Result<WorkItem, StoreError> {
            self.inner.mark_no_changes(id, reason)
        }
        fn reclaim_stuck(&self, older_than: Duration) -> Result<Vec<String>, StoreError> {
            self.inner.reclaim_stuck(older_than)
        }
        fn purge_terminal(&self, older_than: Duration, statuses: &[WorkStatus]) -> Result<usize, StoreError> {
            self.inner.purge_terminal(older_than, statuses)
        }
        fn get(&self, id: &str) -> Result<Option<WorkItem>, StoreError> {
            self.inner.get(id)
        }
        fn list(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, StoreError> {
            self.inner.list(filter)
        }
        fn has_active(&self, subject_key: &str, t: CorrectionType) -> Result<bool, StoreError> {
            self.inner.has_active(subject_key, t)
        }
        fn last_corrected_at(&self, subject_key: &str, t: CorrectionType) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.last_corrected_at(subject_key, t)
        }
        fn delete(&self, id: &str) -> Result<WorkItem, StoreError> {
            self.inner.delete(id)
        }
        fn import(&self, items: Vec<WorkItem>) -> Result<usize, StoreError> {
            self.inner.import(items)
        }
        fn register_batch(&self, id: &str, t: CorrectionType, cost: f64) -> Result<Batch, StoreError> {
            self.inner.register_batch(id, t, cost)
        }
        fn batch_summary(&self, id: &str) -> Result<Option<BatchSummary>, StoreError> {
            self.inner.batch_summary(id)
        }
        fn batches(&self) -> Result<Vec<Batch>, StoreError> {
            self.inner.batches()
        }
    }

    #[tokio::test]
    async fn store_failure_releases_item_to_pending() {
        let store = Arc::new(BrokenCommitStore {
            inner: InMemoryStore::new(),
        });
        let item = store.create("golf", CorrectionType::Title, json!({"title": "Golf"})).unwrap();
        let item = store.claim(&item.id).unwrap();
        let p = processor(store.clone(), r#"{"title": "Volkswagen Golf GTI"}"#);

        let err = p.process(&item, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(store.get(&item.id).unwrap().unwrap().status, WorkStatus::Pending);
    }
}
