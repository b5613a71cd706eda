use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{CallbackRegistry, ExecutionStore, StoreError, TenantStore, TokenRedemption};
use crate::workflow::types::{
    CallbackToken, ExecutionId, TenantRecord, TenantStatus, TokenId, TokenStatus,
    WorkflowExecution,
};

/// In-process backend. Each table sits behind its own lock; a compare-and-swap
/// holds the write lock across its check and its write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    executions: RwLock<HashMap<ExecutionId, WorkflowExecution>>,
    tokens: RwLock<HashMap<TokenId, CallbackToken>>,
    tenants: RwLock<HashMap<String, TenantRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(StoreError::Duplicate {
                key: execution.id.to_string(),
            });
        }
        executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn swap_execution(
        &self,
        expected_version: u64,
        next: &WorkflowExecution,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&next.id) {
            Some(current) if current.version == expected_version => {
                *current = next.clone();
                Ok(true)
            }
            Some(current) => {
                debug!(
                    execution_id = %next.id,
                    expected_version,
                    stored_version = current.version,
                    "Execution CAS rejected"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn running_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect())
    }

    async fn executions_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut found: Vec<WorkflowExecution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.created_at);
        Ok(found)
    }
}

#[async_trait]
impl CallbackRegistry for MemoryStore {
    async fn issue_token(&self, token: &CallbackToken) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&token.id) {
            return Err(StoreError::Duplicate {
                key: token.id.to_string(),
            });
        }
        tokens.insert(token.id.clone(), token.clone());
        Ok(())
    }

    async fn load_token(&self, id: &TokenId) -> Result<Option<CallbackToken>, StoreError> {
        Ok(self.tokens.read().await.get(id).cloned())
    }

    async fn consume_token(
        &self,
        id: &TokenId,
        now: DateTime<Utc>,
    ) -> Result<TokenRedemption, StoreError> {
        let mut tokens = self.tokens.write().await;
        let Some(token) = tokens.get_mut(id) else {
            return Ok(TokenRedemption::Invalid);
        };
        Ok(redeem(token, now))
    }

    async fn invalidate_token(&self, id: &TokenId) -> Result<bool, StoreError> {
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(id) {
            Some(token) if token.status == TokenStatus::Outstanding => {
                token.status = TokenStatus::Invalidated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn void_token(&self, id: &TokenId) -> Result<bool, StoreError> {
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(id) {
            Some(token) if token.status == TokenStatus::Consumed => {
                token.status = TokenStatus::Invalidated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn outstanding_tokens(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<CallbackToken>, StoreError> {
        Ok(self
            .tokens
            .read()
            .await
            .values()
            .filter(|t| &t.execution_id == execution_id && t.status == TokenStatus::Outstanding)
            .cloned()
            .collect())
    }
}

/// Shared redemption rule for every backend.
pub(crate) fn redeem(token: &mut CallbackToken, now: DateTime<Utc>) -> TokenRedemption {
    match token.status {
        TokenStatus::Consumed => TokenRedemption::AlreadyConsumed,
        TokenStatus::Invalidated => TokenRedemption::Invalid,
        TokenStatus::Outstanding if now >= token.expires_at => {
            token.status = TokenStatus::Invalidated;
            TokenRedemption::Invalid
        }
        TokenStatus::Outstanding => {
            token.status = TokenStatus::Consumed;
            TokenRedemption::Consumed(token.clone())
        }
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn load_tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>, StoreError> {
        Ok(self.tenants.read().await.get(tenant_id).cloned())
    }

    async fn insert_tenant(&self, record: &TenantRecord) -> Result<bool, StoreError> {
        let mut tenants = self.tenants.write().await;
        if tenants.contains_key(&record.tenant_id) {
            return Ok(false);
        }
        tenants.insert(record.tenant_id.clone(), record.clone());
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        tenant_id: &str,
        expected: TenantStatus,
        new_status: TenantStatus,
    ) -> Result<bool, StoreError> {
        let mut tenants = self.tenants.write().await;
        match tenants.get_mut(tenant_id) {
            Some(record) if record.status == expected => {
                record.status = new_status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_tenant_by_name(&self, name: &str) -> Result<Option<TenantRecord>, StoreError> {
        Ok(self
            .tenants
            .read()
            .await
            .values()
            .find(|t| t.name == name)
            .cloned())
    }
}
