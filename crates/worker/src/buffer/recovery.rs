use siwatt_common::WorkerError;

use super::{FileBuffer, RecordHandler};

/// Hands out the per-device handler the buffer should drain into.
#[allow(async_fn_in_trait)]
pub trait HandlerFactory {
    type Handler: RecordHandler;

    fn handler_for(&mut self, device_code: &str) -> &mut Self::Handler;
}

/// Drains every device's buffer file on startup, so records stranded by a
/// previous crash are replayed before live traffic resumes.
pub struct RecoveryManager<'a> {
    buffer: &'a FileBuffer,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(buffer: &'a FileBuffer) -> Self {
        Self { buffer }
    }

    pub async fn replay_all<F: HandlerFactory>(&self, factory: &mut F) -> Result<(), WorkerError> {
        for device_code in self.buffer.list_devices().await? {
            let handler = factory.handler_for(&device_code);
            let outcome = self.buffer.process(&device_code, handler).await?;
            tracing::info!(
                %device_code,
                processed = outcome.processed,
                remaining = outcome.remaining,
                "recovery replayed buffered records"
            );
        }
        Ok(())
    }
}
