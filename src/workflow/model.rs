//! Work items (orders) and sub-items (images)
//!
//! Records are created outside the orchestrator. The core only moves them
//! through their stage/status fields, and those transitions never revert.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle stage of a work item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Pending => "pending",
            ProcessingStage::Processing => "processing",
            ProcessingStage::Completed => "completed",
            ProcessingStage::Failed => "failed",
        }
    }

    /// pending → processing → completed | failed
    pub fn can_transition_to(&self, next: ProcessingStage) -> bool {
        matches!(
            (self, next),
            (ProcessingStage::Pending, ProcessingStage::Processing)
                | (ProcessingStage::Processing, ProcessingStage::Completed)
                | (ProcessingStage::Processing, ProcessingStage::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStage::Completed | ProcessingStage::Failed)
    }
}

/// Analysis status of a sub-item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }
}

/// Status mirrored onto the batch a work item belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Kind of analysis requested from the analysis service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    #[default]
    Lifestyle,
    Product,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Lifestyle => "lifestyle",
            AnalysisKind::Product => "product",
        }
    }
}

/// Top-level unit of orchestration (an order)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub processing_stage: ProcessingStage,
    #[serde(default = "default_payment_status")]
    pub payment_status: String,
}

/// Payment status that makes a pending work item claimable
pub const PAYMENT_COMPLETED: &str = "completed";

fn default_payment_status() -> String {
    "pending".to_string()
}

impl WorkItem {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            batch_id: None,
            processing_stage: ProcessingStage::Pending,
            payment_status: PAYMENT_COMPLETED.to_string(),
        }
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    /// Eligible for claiming: pending and paid
    pub fn is_claimable(&self) -> bool {
        self.processing_stage == ProcessingStage::Pending && self.payment_status == PAYMENT_COMPLETED
    }

    pub fn reference(&self) -> WorkItemRef {
        WorkItemRef {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            batch_id: self.batch_id.clone(),
        }
    }
}

/// Identity of the work item a run currently holds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItemRef {
    pub id: String,
    pub user_id: String,
    pub batch_id: Option<String>,
}

/// Child unit (an image) processed within a claimed work item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubItem {
    pub id: String,
    pub order_id: String,
    /// Path of the original object inside the storage container
    pub original_path: String,
    #[serde(default)]
    pub analysis_status: AnalysisStatus,
    #[serde(default)]
    pub analysis_kind: Option<AnalysisKind>,
    #[serde(default)]
    pub analysis: Option<Value>,
    #[serde(default)]
    pub processed_path: Option<String>,
}

impl SubItem {
    pub fn new(
        id: impl Into<String>,
        order_id: impl Into<String>,
        original_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            order_id: order_id.into(),
            original_path: original_path.into(),
            analysis_status: AnalysisStatus::Pending,
            analysis_kind: None,
            analysis: None,
            processed_path: None,
        }
    }

    /// Where the embedded copy of this sub-item is written
    pub fn output_path(&self) -> String {
        match self.original_path.rsplit_once('/') {
            Some((dir, file)) => format!("{}/processed/{}", dir, file),
            None => format!("processed/{}", self.original_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_transitions_never_revert() {
        use ProcessingStage::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(Completed.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn test_work_item_from_row() {
        let row = json!({
            "id": "order-1",
            "user_id": "user-1",
            "batch_id": "batch-1",
            "processing_stage": "pending",
            "payment_status": "completed",
            "created_at": "2024-01-15T10:00:00Z"
        });
        let item: WorkItem = serde_json::from_value(row).unwrap();
        assert!(item.is_claimable());
        assert_eq!(item.reference().batch_id.as_deref(), Some("batch-1"));
    }

    #[test]
    fn test_unpaid_item_is_not_claimable() {
        let mut item = WorkItem::new("order-1", "user-1");
        item.payment_status = "pending".to_string();
        assert!(!item.is_claimable());
    }

    #[test]
    fn test_row_without_payment_status_is_not_claimable() {
        let row = json!({
            "id": "order-1",
            "user_id": "user-1",
            "processing_stage": "pending"
        });
        let item: WorkItem = serde_json::from_value(row).unwrap();
        assert_eq!(item.payment_status, "pending");
        assert!(!item.is_claimable());
    }

    #[test]
    fn test_output_path() {
        let image = SubItem::new("img-1", "order-1", "user-1/order-1/photo.jpg");
        assert_eq!(image.output_path(), "user-1/order-1/processed/photo.jpg");

        let image = SubItem::new("img-2", "order-1", "photo.jpg");
        assert_eq!(image.output_path(), "processed/photo.jpg");
    }
}
