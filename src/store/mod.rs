// Persistence ports for the orchestrator
// Every shared mutable record (execution, token, tenant) is guarded by an
// optimistic check inside the store; nothing else locks.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::workflow::types::{
    CallbackToken, ExecutionId, TenantRecord, TenantStatus, TokenId, WorkflowExecution,
};

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate key: {key}")]
    Duplicate { key: String },

    #[error("Lock acquisition failed: {reason}")]
    Lock { reason: String },

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result of presenting a callback token for redemption
#[derive(Debug, Clone, PartialEq)]
pub enum TokenRedemption {
    /// The token moved Outstanding -> Consumed in this call
    Consumed(CallbackToken),
    AlreadyConsumed,
    /// Unknown, expired, or invalidated
    Invalid,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a brand-new execution. Fails with `Duplicate` if the id exists.
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    async fn load_execution(&self, id: &ExecutionId)
        -> Result<Option<WorkflowExecution>, StoreError>;

    /// Replace the stored execution only if its version is still `expected_version`.
    ///
    /// Returns `false` when another writer got there first.
    async fn swap_execution(
        &self,
        expected_version: u64,
        next: &WorkflowExecution,
    ) -> Result<bool, StoreError>;

    /// Executions that have not reached a terminal state.
    async fn running_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError>;

    async fn executions_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;
}

#[async_trait]
pub trait CallbackRegistry: Send + Sync {
    async fn issue_token(&self, token: &CallbackToken) -> Result<(), StoreError>;

    async fn load_token(&self, id: &TokenId) -> Result<Option<CallbackToken>, StoreError>;

    /// Atomically redeem a token. Expired tokens are invalidated on sight.
    async fn consume_token(
        &self,
        id: &TokenId,
        now: DateTime<Utc>,
    ) -> Result<TokenRedemption, StoreError>;

    /// Withdraw an outstanding token. Returns `false` if it was not outstanding.
    async fn invalidate_token(&self, id: &TokenId) -> Result<bool, StoreError>;

    /// Move a consumed token to invalidated after its resume was not applied.
    /// Returns `false` if the token was not consumed.
    async fn void_token(&self, id: &TokenId) -> Result<bool, StoreError>;

    async fn outstanding_tokens(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<CallbackToken>, StoreError>;
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn load_tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>, StoreError>;

    /// Insert if absent. Returns `false` when a record already exists.
    async fn insert_tenant(&self, record: &TenantRecord) -> Result<bool, StoreError>;

    /// Conditional status write; `false` means the stored status was not `expected`.
    async fn compare_and_swap(
        &self,
        tenant_id: &str,
        expected: TenantStatus,
        new_status: TenantStatus,
    ) -> Result<bool, StoreError>;

    /// Secondary lookup by tenant name.
    async fn find_tenant_by_name(&self, name: &str) -> Result<Option<TenantRecord>, StoreError>;
}

/// The three stores the orchestrator works against
#[derive(Clone)]
pub struct Stores {
    pub executions: Arc<dyn ExecutionStore>,
    pub callbacks: Arc<dyn CallbackRegistry>,
    pub tenants: Arc<dyn TenantStore>,
}

impl Stores {
    /// Use one backend for all three concerns.
    pub fn shared<S>(backend: Arc<S>) -> Self
    where
        S: ExecutionStore + CallbackRegistry + TenantStore + 'static,
    {
        Self {
            executions: backend.clone(),
            callbacks: backend.clone(),
            tenants: backend,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
