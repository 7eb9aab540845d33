//! In-memory collaborators
//!
//! [`InMemoryStore`] and [`InMemoryStorage`] implement the store and storage
//! traits over plain collections. They back the `simulate` command and
//! the integration tests. Transactions are snapshot based: `begin` copies
//! the tables, `rollback` restores the copy, `commit` drops it.
//!
//! [`FaultInjector`] scripts failures per operation name, optionally
//! restricted to one target (item id, sub-item id or object path) and to
//! a number of occurrences.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::{DatabaseOp, ObjectStorage, RelationalStore, StorageOp};
use crate::engine::recovery::ERROR_KIND_KEY;
use crate::engine::result::ResultEnvelope;
use crate::workflow::model::{AnalysisStatus, BatchStatus, ProcessingStage, SubItem, WorkItem};

#[derive(Debug, Clone)]
struct FaultRule {
    operation: String,
    target: Option<String>,
    remaining: Option<u32>,
    message: String,
}

#[derive(Debug, Default)]
struct FaultState {
    rules: Vec<FaultRule>,
    hits: BTreeMap<String, usize>,
}

/// Scripted failures shared between collaborators
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    inner: Arc<Mutex<FaultState>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FaultState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, operation: &str, target: Option<&str>, remaining: Option<u32>, message: &str) {
        self.state().rules.push(FaultRule {
            operation: operation.to_string(),
            target: target.map(str::to_string),
            remaining,
            message: message.to_string(),
        });
    }

    /// Fail every call to `operation`
    pub fn fail_always(&self, operation: &str, message: &str) -> &Self {
        self.push(operation, None, None, message);
        self
    }

    /// Fail the next `times` calls to `operation`
    pub fn fail_times(&self, operation: &str, times: u32, message: &str) -> &Self {
        self.push(operation, None, Some(times), message);
        self
    }

    /// Fail every call to `operation` whose target contains `target`
    pub fn fail_matching(&self, operation: &str, target: &str, message: &str) -> &Self {
        self.push(operation, Some(target), None, message);
        self
    }

    /// Fail the next `times` calls to `operation` whose target contains
    /// `target`
    pub fn fail_matching_times(&self, operation: &str, target: &str, times: u32, message: &str) -> &Self {
        self.push(operation, Some(target), Some(times), message);
        self
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.rules.clear();
        state.hits.clear();
    }

    /// Injected failures returned so far for `operation`
    pub fn hits(&self, operation: &str) -> usize {
        self.state().hits.get(operation).copied().unwrap_or(0)
    }

    /// Failure envelope if a rule matches this call
    pub fn check(&self, operation: &str, target: &str) -> Option<ResultEnvelope> {
        let mut state = self.state();
        let rule = state.rules.iter_mut().find(|rule| {
            rule.operation == operation
                && rule.remaining != Some(0)
                && rule
                    .target
                    .as_deref()
                    .map_or(true, |wanted| target.contains(wanted))
        })?;

        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        let message = rule.message.clone();
        *state.hits.entry(operation.to_string()).or_insert(0) += 1;

        Some(ResultEnvelope::failure(message).with_metadata("injected", true))
    }
}

/// Notification record written during finalization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub item_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    items: Vec<WorkItem>,
    sub_items: Vec<SubItem>,
    batches: BTreeMap<String, BatchStatus>,
    notifications: Vec<Notification>,
    failure_reasons: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct StoreState {
    tables: Tables,
    snapshot: Option<Tables>,
    calls: Vec<DatabaseOp>,
}

/// Relational store over in-memory tables
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<StoreState>>,
    faults: FaultInjector,
}

fn id_row(id: &str) -> Value {
    json!([{ "id": id }])
}

fn to_rows<T: Serialize>(records: &[T]) -> Value {
    serde_json::to_value(records).unwrap_or_else(|_| json!([]))
}

fn missing(kind: &str, id: &str) -> ResultEnvelope {
    ResultEnvelope::failure(format!("{} {} not found", kind, id))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Work items are kept in insertion order, which is their age order
    pub async fn insert_item(&self, item: WorkItem) {
        self.inner.write().await.tables.items.push(item);
    }

    pub async fn insert_sub_item(&self, sub_item: SubItem) {
        self.inner.write().await.tables.sub_items.push(sub_item);
    }

    pub async fn insert_batch(&self, batch_id: &str, status: BatchStatus) {
        self.inner
            .write()
            .await
            .tables
            .batches
            .insert(batch_id.to_string(), status);
    }

    pub async fn item(&self, id: &str) -> Option<WorkItem> {
        let state = self.inner.read().await;
        state.tables.items.iter().find(|i| i.id == id).cloned()
    }

    pub async fn sub_item(&self, id: &str) -> Option<SubItem> {
        let state = self.inner.read().await;
        state.tables.sub_items.iter().find(|s| s.id == id).cloned()
    }

    pub async fn sub_items_of(&self, item_id: &str) -> Vec<SubItem> {
        let state = self.inner.read().await;
        state
            .tables
            .sub_items
            .iter()
            .filter(|s| s.order_id == item_id)
            .cloned()
            .collect()
    }

    pub async fn batch_status(&self, batch_id: &str) -> Option<BatchStatus> {
        self.inner.read().await.tables.batches.get(batch_id).copied()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.inner.read().await.tables.notifications.clone()
    }

    pub async fn failure_reason(&self, item_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .tables
            .failure_reasons
            .get(item_id)
            .cloned()
    }

    /// Every operation received, in order
    pub async fn calls(&self) -> Vec<DatabaseOp> {
        self.inner.read().await.calls.clone()
    }

    pub async fn count_calls(&self, name: &str) -> usize {
        let state = self.inner.read().await;
        state.calls.iter().filter(|op| op.name() == name).count()
    }

    fn target(op: &DatabaseOp) -> &str {
        match op {
            DatabaseOp::FetchItem { item_id }
            | DatabaseOp::ClaimItem { item_id }
            | DatabaseOp::ListSubItems { item_id }
            | DatabaseOp::CompleteItem { item_id }
            | DatabaseOp::FailItem { item_id, .. }
            | DatabaseOp::EnqueueNotification { item_id, .. } => item_id,
            DatabaseOp::SetBatchStatus { batch_id, .. } => batch_id,
            DatabaseOp::StoreAnalysis { sub_item_id, .. }
            | DatabaseOp::SetProcessedPath { sub_item_id, .. }
            | DatabaseOp::SetSubItemStatus { sub_item_id, .. } => sub_item_id,
            _ => "",
        }
    }

    fn apply(state: &mut StoreState, op: DatabaseOp) -> ResultEnvelope {
        let tables = &mut state.tables;
        match op {
            DatabaseOp::Ping => ResultEnvelope::ok(json!([{ "health_check": 1 }])),
            DatabaseOp::CountPending => {
                let count = tables.items.iter().filter(|i| i.is_claimable()).count();
                ResultEnvelope::ok(json!([{ "count": count }]))
            }
            DatabaseOp::ListPending { limit } => {
                let pending: Vec<&WorkItem> = tables
                    .items
                    .iter()
                    .filter(|i| i.is_claimable())
                    .take(limit)
                    .collect();
                ResultEnvelope::ok(to_rows(&pending))
            }
            DatabaseOp::FetchItem { item_id } => {
                let found: Vec<&WorkItem> =
                    tables.items.iter().filter(|i| i.id == item_id).collect();
                ResultEnvelope::ok(to_rows(&found))
            }
            DatabaseOp::ClaimItem { item_id } => {
                match tables
                    .items
                    .iter_mut()
                    .find(|i| i.id == item_id && i.processing_stage == ProcessingStage::Pending)
                {
                    Some(item) => {
                        item.processing_stage = ProcessingStage::Processing;
                        ResultEnvelope::ok(id_row(&item_id))
                    }
                    None => ResultEnvelope::ok(json!([])),
                }
            }
            DatabaseOp::SetBatchStatus { batch_id, status } => {
                tables.batches.insert(batch_id.clone(), status);
                ResultEnvelope::ok(id_row(&batch_id))
            }
            DatabaseOp::ListSubItems { item_id } => {
                let found: Vec<&SubItem> = tables
                    .sub_items
                    .iter()
                    .filter(|s| s.order_id == item_id)
                    .collect();
                ResultEnvelope::ok(to_rows(&found))
            }
            DatabaseOp::StoreAnalysis {
                sub_item_id,
                analysis,
            } => match tables.sub_items.iter_mut().find(|s| s.id == sub_item_id) {
                Some(sub_item) => {
                    sub_item.analysis = Some(analysis);
                    ResultEnvelope::ok(id_row(&sub_item_id))
                }
                None => missing("Sub-item", &sub_item_id),
            },
            DatabaseOp::SetProcessedPath {
                sub_item_id,
                processed_path,
            } => match tables.sub_items.iter_mut().find(|s| s.id == sub_item_id) {
                Some(sub_item) => {
                    sub_item.processed_path = Some(processed_path);
                    ResultEnvelope::ok(id_row(&sub_item_id))
                }
                None => missing("Sub-item", &sub_item_id),
            },
            DatabaseOp::SetSubItemStatus {
                sub_item_id,
                status,
            } => match tables.sub_items.iter_mut().find(|s| s.id == sub_item_id) {
                Some(sub_item) => {
                    sub_item.analysis_status = status;
                    ResultEnvelope::ok(id_row(&sub_item_id))
                }
                None => missing("Sub-item", &sub_item_id),
            },
            DatabaseOp::CompleteItem { item_id } => {
                Self::finish(tables, &item_id, ProcessingStage::Completed)
            }
            DatabaseOp::FailItem { item_id, reason } => {
                let result = Self::finish(tables, &item_id, ProcessingStage::Failed);
                if result.is_success() {
                    tables.failure_reasons.insert(item_id, reason);
                }
                result
            }
            DatabaseOp::EnqueueNotification { item_id, user_id } => {
                tables.notifications.push(Notification {
                    item_id: item_id.clone(),
                    user_id,
                });
                ResultEnvelope::ok(json!([{ "id": tables.notifications.len(), "order_id": item_id }]))
            }
            DatabaseOp::Begin => {
                state.snapshot = Some(state.tables.clone());
                ResultEnvelope::ok_empty()
            }
            DatabaseOp::Commit => {
                state.snapshot = None;
                ResultEnvelope::ok_empty()
            }
            DatabaseOp::Rollback => {
                if let Some(snapshot) = state.snapshot.take() {
                    state.tables = snapshot;
                }
                ResultEnvelope::ok_empty()
            }
        }
    }

    /// processing → completed | failed; any other starting stage fails
    fn finish(tables: &mut Tables, item_id: &str, stage: ProcessingStage) -> ResultEnvelope {
        let Some(item) = tables.items.iter_mut().find(|i| i.id == item_id) else {
            return missing("Work item", item_id);
        };
        if !item.processing_stage.can_transition_to(stage) {
            return ResultEnvelope::failure(format!(
                "Work item {} cannot move from {} to {}",
                item_id,
                item.processing_stage.as_str(),
                stage.as_str()
            ))
            .with_metadata(ERROR_KIND_KEY, "data_integrity");
        }
        item.processing_stage = stage;
        ResultEnvelope::ok(id_row(item_id))
    }
}

#[async_trait]
impl RelationalStore for InMemoryStore {
    async fn execute(&self, op: DatabaseOp) -> ResultEnvelope {
        let name = op.name();
        let mut state = self.inner.write().await;
        state.calls.push(op.clone());

        if let Some(failure) = self.faults.check(name, Self::target(&op)) {
            return failure.with_metadata("operation", name);
        }

        let result = Self::apply(&mut state, op);
        let row_count = result.rows().len();
        result
            .with_metadata("operation", name)
            .with_metadata("row_count", row_count)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StoredObject {
    size: u64,
    content_type: String,
}

#[derive(Debug, Default)]
struct StorageState {
    containers: BTreeSet<String>,
    objects: BTreeMap<(String, String), StoredObject>,
    calls: Vec<StorageOp>,
}

/// Object storage over an in-memory map
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<RwLock<StorageState>>,
    faults: FaultInjector,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub async fn create_container(&self, container: &str) {
        self.inner
            .write()
            .await
            .containers
            .insert(container.to_string());
    }

    /// Store an object, creating its container if needed
    pub async fn put_object(&self, container: &str, path: &str, size: u64) {
        let mut state = self.inner.write().await;
        state.containers.insert(container.to_string());
        state.objects.insert(
            (container.to_string(), path.to_string()),
            StoredObject {
                size,
                content_type: "image/jpeg".to_string(),
            },
        );
    }

    pub async fn remove_object(&self, container: &str, path: &str) -> bool {
        self.inner
            .write()
            .await
            .objects
            .remove(&(container.to_string(), path.to_string()))
            .is_some()
    }

    pub async fn contains(&self, container: &str, path: &str) -> bool {
        self.inner
            .read()
            .await
            .objects
            .contains_key(&(container.to_string(), path.to_string()))
    }

    pub async fn calls(&self) -> Vec<StorageOp> {
        self.inner.read().await.calls.clone()
    }

    fn apply(state: &StorageState, op: StorageOp) -> ResultEnvelope {
        match op {
            StorageOp::ListObjects {
                container,
                prefix,
                extension,
            } => {
                if !state.containers.contains(&container) {
                    return ResultEnvelope::failure(format!("Bucket {} not found", container))
                        .with_metadata("status_code", 404);
                }
                let objects: Vec<Value> = state
                    .objects
                    .iter()
                    .filter(|((c, path), _)| *c == container && path.starts_with(&prefix))
                    .filter(|((_, path), _)| {
                        extension.as_deref().map_or(true, |ext| path.ends_with(ext))
                    })
                    .map(|((_, path), object)| {
                        let name = path.rsplit('/').next().unwrap_or(path);
                        json!({
                            "name": name,
                            "path": path,
                            "size": object.size,
                            "mime_type": object.content_type,
                        })
                    })
                    .collect();
                let count = objects.len();
                ResultEnvelope::ok(Value::Array(objects))
                    .with_metadata("bucket", container)
                    .with_metadata("file_count", count)
            }
            StorageOp::CreateAccessLink {
                container,
                path,
                ttl_secs,
            } => {
                if !state.objects.contains_key(&(container.clone(), path.clone())) {
                    return ResultEnvelope::failure(format!("Object {} not found", path))
                        .with_metadata("status_code", 404);
                }
                ResultEnvelope::ok(json!({
                    "path": path,
                    "signed_url": format!("memory://{}/{}?expires_in={}", container, path, ttl_secs),
                }))
            }
            StorageOp::VerifyExists { container, path } => {
                let object = state.objects.get(&(container.clone(), path.clone()));
                ResultEnvelope::ok(json!({
                    "exists": object.is_some(),
                    "path": path,
                    "size": object.map(|o| o.size),
                }))
                .with_metadata("bucket", container)
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for InMemoryStorage {
    async fn execute(&self, op: StorageOp) -> ResultEnvelope {
        let name = op.name();
        let target = match &op {
            StorageOp::ListObjects { container, .. } => container.clone(),
            StorageOp::CreateAccessLink { path, .. } | StorageOp::VerifyExists { path, .. } => {
                path.clone()
            }
        };

        let mut state = self.inner.write().await;
        state.calls.push(op.clone());

        if let Some(failure) = self.faults.check(name, &target) {
            return failure.with_metadata("operation", name);
        }
        Self::apply(&state, op).with_metadata("operation", name)
    }
}

/// Populate `store` and `storage` with `orders` pending, paid work items of
/// `images` sub-items each. Returns the work item ids, oldest first.
pub async fn seed(
    store: &InMemoryStore,
    storage: &InMemoryStorage,
    container: &str,
    orders: usize,
    images: usize,
) -> Vec<String> {
    storage.create_container(container).await;

    let mut ids = Vec::with_capacity(orders);
    for order in 1..=orders {
        let item_id = format!("order-{}", order);
        let user_id = format!("user-{}", order);
        let batch_id = format!("batch-{}", order);

        store
            .insert_item(WorkItem::new(&item_id, &user_id).with_batch(&batch_id))
            .await;
        store.insert_batch(&batch_id, BatchStatus::Processing).await;

        for image in 1..=images {
            let path = format!("{}/{}/image-{}.jpg", user_id, item_id, image);
            storage.put_object(container, &path, 1_024_000).await;
            store
                .insert_sub_item(SubItem::new(
                    format!("{}-image-{}", item_id, image),
                    &item_id,
                    path,
                ))
                .await;
        }
        ids.push(item_id);
    }
    ids
}
