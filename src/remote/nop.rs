//! remote::nop
//!
//! A provider that moves no data.
//!
//! Every call succeeds. `start_operation` reports a `Running operation`
//! phase and, when the parameters carry a `delay` property (seconds),
//! waits that long first. The delay gives tests a window in which to abort
//! a running operation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::traits::{OperationContext, ProviderState, RemoteProvider};
use super::NOP_PROVIDER;
use crate::core::error::Result;
use crate::core::tags::TagFilter;
use crate::core::types::{Commit, Remote, RemoteParameters, Volume};
use crate::ops::record::{OperationType, ProgressEntry};

const DELAY_PROPERTY: &str = "delay";

/// The no-op provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopProvider;

impl NopProvider {
    pub fn new() -> Self {
        Self
    }

    fn delay(params: &RemoteParameters) -> Option<Duration> {
        params
            .properties
            .get(DELAY_PROPERTY)
            .and_then(Value::as_u64)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl RemoteProvider for NopProvider {
    fn name(&self) -> &'static str {
        NOP_PROVIDER
    }

    async fn list_commits(
        &self,
        _remote: &Remote,
        _params: &RemoteParameters,
        _tags: &TagFilter,
    ) -> Result<Vec<Commit>> {
        Ok(Vec::new())
    }

    async fn get_commit(
        &self,
        _remote: &Remote,
        _params: &RemoteParameters,
        commit_id: &str,
    ) -> Result<Commit> {
        Ok(Commit::new(commit_id))
    }

    async fn validate_operation(
        &self,
        _remote: &Remote,
        _params: &RemoteParameters,
        _commit_id: &str,
        _kind: OperationType,
        _metadata_only: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn start_operation(&self, ctx: &OperationContext) -> Result<ProviderState> {
        ctx.add_progress(ProgressEntry::start("Running operation"));
        if let Some(delay) = Self::delay(&ctx.params) {
            debug!(
                operation = %ctx.operation.id,
                delay_secs = delay.as_secs(),
                "nop provider sleeping"
            );
            ctx.cancellable(async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }
        ctx.add_progress(ProgressEntry::end());
        Ok(Box::new(()))
    }

    async fn pull_volume(
        &self,
        _ctx: &OperationContext,
        _state: &ProviderState,
        _volume: &Volume,
        _mountpoint: &Path,
        _scratch: &Path,
    ) -> Result<()> {
        Ok(())
    }

    async fn push_volume(
        &self,
        _ctx: &OperationContext,
        _state: &ProviderState,
        _volume: &Volume,
        _mountpoint: &Path,
        _scratch: &Path,
    ) -> Result<()> {
        Ok(())
    }

    async fn push_metadata(
        &self,
        _ctx: &OperationContext,
        _state: &ProviderState,
        _commit: &Commit,
        _is_update: bool,
    ) -> Result<()> {
        Ok(())
    }
}
