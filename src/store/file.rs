use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::memory::redeem;
use super::{CallbackRegistry, ExecutionStore, StoreError, TenantStore, TokenRedemption};
use crate::config::StorageConfig;
use crate::workflow::types::{
    CallbackToken, ExecutionId, TenantRecord, TenantStatus, TokenId, TokenStatus,
    WorkflowExecution,
};

const LOCK_FILE: &str = ".table.lock";

/// Durable backend: one JSON document per record, one directory per table.
///
/// Read-modify-write operations hold an exclusive `fd-lock` on the table's lock
/// file and publish the new document with write-to-temp + rename, so several
/// processes sharing the directory see the same compare-and-swap semantics.
/// Plain reads take no lock; rename keeps them from observing partial writes.
#[derive(Debug, Clone)]
pub struct FileStore {
    executions_dir: PathBuf,
    tokens_dir: PathBuf,
    tenants_dir: PathBuf,
}

impl FileStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            executions_dir: config.directory.join(&config.executions_table),
            tokens_dir: config.directory.join(&config.tokens_table),
            tenants_dir: config.directory.join(&config.tenants_table),
        }
    }

    /// Open a store rooted at `directory` with the default table names.
    pub fn open(directory: impl AsRef<Path>) -> Self {
        let config = StorageConfig {
            directory: directory.as_ref().to_path_buf(),
            ..StorageConfig::default()
        };
        Self::new(&config)
    }
}

/// Map an arbitrary key onto a safe file name.
fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 5);
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name.push_str(".json");
    name
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: path.display().to_string(),
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let staging = path.with_extension("tmp");
    fs::write(&staging, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&staging, path)?;
    Ok(())
}

fn list_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        if let Some(record) = read_record(&path)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Run `op` while holding the table's exclusive lock.
fn with_table_lock<T>(
    dir: &Path,
    op: impl FnOnce() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    fs::create_dir_all(dir)?;
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE))?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _guard = lock.write().map_err(|e| StoreError::Lock {
        reason: format!("{}: {e}", dir.display()),
    })?;
    op()
}

async fn blocking<T, F>(op: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| StoreError::Lock {
            reason: format!("blocking store task failed: {e}"),
        })?
}

#[async_trait]
impl ExecutionStore for FileStore {
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let dir = self.executions_dir.clone();
        let execution = execution.clone();
        blocking(move || {
            with_table_lock(&dir, || {
                let path = dir.join(file_name(execution.id.as_str()));
                if path.exists() {
                    return Err(StoreError::Duplicate {
                        key: execution.id.to_string(),
                    });
                }
                write_record(&path, &execution)
            })
        })
        .await
    }

    async fn load_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let path = self.executions_dir.join(file_name(id.as_str()));
        blocking(move || read_record(&path)).await
    }

    async fn swap_execution(
        &self,
        expected_version: u64,
        next: &WorkflowExecution,
    ) -> Result<bool, StoreError> {
        let dir = self.executions_dir.clone();
        let next = next.clone();
        blocking(move || {
            with_table_lock(&dir, || {
                let path = dir.join(file_name(next.id.as_str()));
                let Some(current) = read_record::<WorkflowExecution>(&path)? else {
                    return Ok(false);
                };
                if current.version != expected_version {
                    debug!(
                        execution_id = %next.id,
                        expected_version,
                        stored_version = current.version,
                        "Execution CAS rejected"
                    );
                    return Ok(false);
                }
                write_record(&path, &next)?;
                Ok(true)
            })
        })
        .await
    }

    async fn running_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        let dir = self.executions_dir.clone();
        let all: Vec<WorkflowExecution> = blocking(move || list_records(&dir)).await?;
        Ok(all.into_iter().filter(|e| !e.is_terminal()).collect())
    }

    async fn executions_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let dir = self.executions_dir.clone();
        let all: Vec<WorkflowExecution> = blocking(move || list_records(&dir)).await?;
        let mut found: Vec<WorkflowExecution> =
            all.into_iter().filter(|e| e.tenant_id == tenant_id).collect();
        found.sort_by_key(|e| e.created_at);
        Ok(found)
    }
}

#[async_trait]
impl CallbackRegistry for FileStore {
    async fn issue_token(&self, token: &CallbackToken) -> Result<(), StoreError> {
        let dir = self.tokens_dir.clone();
        let token = token.clone();
        blocking(move || {
            with_table_lock(&dir, || {
                let path = dir.join(file_name(token.id.as_str()));
                if path.exists() {
                    return Err(StoreError::Duplicate {
                        key: token.id.to_string(),
                    });
                }
                write_record(&path, &token)
            })
        })
        .await
    }

    async fn load_token(&self, id: &TokenId) -> Result<Option<CallbackToken>, StoreError> {
        let path = self.tokens_dir.join(file_name(id.as_str()));
        blocking(move || read_record(&path)).await
    }

    async fn consume_token(
        &self,
        id: &TokenId,
        now: DateTime<Utc>,
    ) -> Result<TokenRedemption, StoreError> {
        let dir = self.tokens_dir.clone();
        let id = id.clone();
        blocking(move || {
            with_table_lock(&dir, || {
                let path = dir.join(file_name(id.as_str()));
                let Some(mut token) = read_record::<CallbackToken>(&path)? else {
                    return Ok(TokenRedemption::Invalid);
                };
                let before = token.status;
                let redemption = redeem(&mut token, now);
                if token.status != before {
                    write_record(&path, &token)?;
                }
                Ok(redemption)
            })
        })
        .await
    }

    async fn invalidate_token(&self, id: &TokenId) -> Result<bool, StoreError> {
        let dir = self.tokens_dir.clone();
        let id = id.clone();
        blocking(move || {
            with_table_lock(&dir, || {
                let path = dir.join(file_name(id.as_str()));
                match read_record::<CallbackToken>(&path)? {
                    Some(mut token) if token.status == TokenStatus::Outstanding => {
                        token.status = TokenStatus::Invalidated;
                        write_record(&path, &token)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
        })
        .await
    }

    async fn void_token(&self, id: &TokenId) -> Result<bool, StoreError> {
        let dir = self.tokens_dir.clone();
        let id = id.clone();
        blocking(move || {
            with_table_lock(&dir, || {
                let path = dir.join(file_name(id.as_str()));
                match read_record::<CallbackToken>(&path)? {
                    Some(mut token) if token.status == TokenStatus::Consumed => {
                        token.status = TokenStatus::Invalidated;
                        write_record(&path, &token)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
        })
        .await
    }

    async fn outstanding_tokens(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<CallbackToken>, StoreError> {
        let dir = self.tokens_dir.clone();
        let all: Vec<CallbackToken> = blocking(move || list_records(&dir)).await?;
        Ok(all
            .into_iter()
            .filter(|t| &t.execution_id == execution_id && t.status == TokenStatus::Outstanding)
            .collect())
    }
}

#[async_trait]
impl TenantStore for FileStore {
    async fn load_tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>, StoreError> {
        let path = self.tenants_dir.join(file_name(tenant_id));
        blocking(move || read_record(&path)).await
    }

    async fn insert_tenant(&self, record: &TenantRecord) -> Result<bool, StoreError> {
        let dir = self.tenants_dir.clone();
        let record = record.clone();
        blocking(move || {
            with_table_lock(&dir, || {
                let path = dir.join(file_name(&record.tenant_id));
                if path.exists() {
                    return Ok(false);
                }
                write_record(&path, &record)?;
                Ok(true)
            })
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        tenant_id: &str,
        expected: TenantStatus,
        new_status: TenantStatus,
    ) -> Result<bool, StoreError> {
        let dir = self.tenants_dir.clone();
        let tenant_id = tenant_id.to_string();
        blocking(move || {
            with_table_lock(&dir, || {
                let path = dir.join(file_name(&tenant_id));
                match read_record::<TenantRecord>(&path)? {
                    Some(mut record) if record.status == expected => {
                        record.status = new_status;
                        write_record(&path, &record)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
        })
        .await
    }

    async fn find_tenant_by_name(&self, name: &str) -> Result<Option<TenantRecord>, StoreError> {
        let dir = self.tenants_dir.clone();
        let all: Vec<TenantRecord> = blocking(move || list_records(&dir)).await?;
        Ok(all.into_iter().find(|t| t.name == name))
    }
}
