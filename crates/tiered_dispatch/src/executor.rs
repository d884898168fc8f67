//! Tier executor contract.
//!
//! Generative, agentic and human tiers are served by external executors.
//! Executors do not enforce their own budget; the dispatcher wraps every
//! call in the tier's timeout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tiered_core::{CoreResult, FunctionMetadata, TierKind};

/// Agentic loop diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgenticExecution {
    /// Loop iterations performed
    pub iterations: u32,
    /// Tools invoked, in call order
    pub tools_used: Vec<String>,
    /// Tokens consumed across iterations
    pub total_tokens: u64,
}

/// Status of a human task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for an assignee
    Pending,
    /// Picked up by an assignee
    Assigned,
    /// Answered
    Completed,
    /// Passed its expiry without an answer
    Expired,
}

/// Pending human task record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanTask {
    /// Task id
    pub task_id: String,
    /// Current status
    pub status: TaskStatus,
    /// Who may answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<String>,
    /// When the task lapses
    pub expires_at: DateTime<Utc>,
}

/// Uniform executor response
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TierResponse {
    /// Output payload
    pub output: Value,
    /// Agentic diagnostics
    pub agentic: Option<AgenticExecution>,
    /// Task record for human tiers
    pub human_task: Option<HumanTask>,
}

impl TierResponse {
    /// Plain output
    #[must_use]
    pub fn new(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    /// Attach agentic diagnostics
    #[must_use]
    pub fn with_agentic(mut self, execution: AgenticExecution) -> Self {
        self.agentic = Some(execution);
        self
    }

    /// Attach a human task record
    #[must_use]
    pub fn with_human_task(mut self, task: HumanTask) -> Self {
        self.human_task = Some(task);
        self
    }
}

/// External executor for one tier
#[async_trait]
pub trait TierExecutor: Send + Sync {
    /// Execute a function.
    ///
    /// # Errors
    ///
    /// Any error is surfaced as a failed dispatch for this tier.
    async fn execute(&self, metadata: &FunctionMetadata, input: &Value)
        -> CoreResult<TierResponse>;
}

/// Executors available to a dispatcher
#[derive(Clone, Default)]
pub struct Executors {
    generative: Option<Arc<dyn TierExecutor>>,
    agentic: Option<Arc<dyn TierExecutor>>,
    human: Option<Arc<dyn TierExecutor>>,
}

impl Executors {
    /// No executors configured
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the generative executor
    #[must_use]
    pub fn with_generative(mut self, executor: Arc<dyn TierExecutor>) -> Self {
        self.generative = Some(executor);
        self
    }

    /// Set the agentic executor
    #[must_use]
    pub fn with_agentic(mut self, executor: Arc<dyn TierExecutor>) -> Self {
        self.agentic = Some(executor);
        self
    }

    /// Set the human executor
    #[must_use]
    pub fn with_human(mut self, executor: Arc<dyn TierExecutor>) -> Self {
        self.human = Some(executor);
        self
    }

    /// Executor for a tier, if one is configured
    #[must_use]
    pub fn get(&self, tier: TierKind) -> Option<&Arc<dyn TierExecutor>> {
        match tier {
            TierKind::Generative => self.generative.as_ref(),
            TierKind::Agentic => self.agentic.as_ref(),
            TierKind::Human => self.human.as_ref(),
            TierKind::Code | TierKind::Cascade => None,
        }
    }
}

impl fmt::Debug for Executors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executors")
            .field("generative", &self.generative.is_some())
            .field("agentic", &self.agentic.is_some())
            .field("human", &self.human.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed;

    #[async_trait]
    impl TierExecutor for Fixed {
        async fn execute(
            &self,
            _metadata: &FunctionMetadata,
            _input: &Value,
        ) -> CoreResult<TierResponse> {
            Ok(TierResponse::new(json!("ok")))
        }
    }

    #[test]
    fn test_executor_lookup() {
        let executors = Executors::new().with_agentic(Arc::new(Fixed));
        assert!(executors.get(TierKind::Agentic).is_some());
        assert!(executors.get(TierKind::Generative).is_none());
        assert!(executors.get(TierKind::Code).is_none());
        assert_eq!(
            format!("{:?}", executors),
            "Executors { generative: false, agentic: true, human: false }"
        );
    }

    #[test]
    fn test_human_task_wire_format() {
        let task = HumanTask {
            task_id: "t1".to_string(),
            status: TaskStatus::Pending,
            assignees: vec![],
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["status"], "pending");
        assert!(value.get("assignees").is_none());
    }
}
