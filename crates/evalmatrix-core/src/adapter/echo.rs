//! Offline adapter that answers with the item input.

use std::time::Duration;

use async_trait::async_trait;

use super::{AdapterError, ModelAdapter};
use crate::domain::DatasetItem;

/// Returns `item.input` unchanged. Used for dry runs of a manifest.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoAdapter;

impl EchoAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModelAdapter for EchoAdapter {
    async fn execute(
        &self,
        item: &DatasetItem,
        _timeout: Duration,
    ) -> Result<serde_json::Value, AdapterError> {
        Ok(item.input.clone())
    }
}
