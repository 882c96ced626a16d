use std::sync::Arc;

use chrono::NaiveDateTime;

use siwatt_common::types::Sample;

use crate::store::{StoreClient, StoreError};

/// Writes the latest-sample snapshot and marks the device online.
pub struct RealtimeProcessor {
    store: Arc<StoreClient>,
}

impl RealtimeProcessor {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Both writes must succeed for the sample to count as processed.
    pub async fn handle(
        &self,
        device_id: i64,
        sample: &Sample,
        dt: NaiveDateTime,
    ) -> Result<(), StoreError> {
        self.store.upsert_realtime(device_id, sample, dt).await?;
        self.store.mark_device_online(device_id, dt).await?;
        Ok(())
    }
}
