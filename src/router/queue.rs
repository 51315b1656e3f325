// =============================================================================
// MOONWIRE v1.0 - Queued Updates & Check-In
// =============================================================================
//
// Router work that could not land (recipient offline, transient failure) is
// persisted as queued rows and replayed when the counterparty signals
// liveness. Rows are claimed PENDING -> PROCESSING with a compare-and-swap
// so concurrent handlers never double-execute, processed in insertion order,
// and finished as COMPLETE, FAILED, or back to PENDING when the failure was
// a timeout worth retrying.
//
// =============================================================================

use tracing::{debug, info, warn};

use crate::types::{
    Address, EngineError, QueuedPayload, QueuedUpdate, QueuedUpdateStatus,
};

use super::ForwardingEngine;

impl ForwardingEngine {
    /// Replay every pending queued update for a channel. Invoked from the
    /// is-alive handler; updates for a given channel run serially in
    /// insertion order.
    pub async fn drain_queued_updates(
        &self,
        channel_address: &Address,
    ) -> Result<usize, EngineError> {
        let pending = self
            .store
            .get_queued_updates(channel_address, &[QueuedUpdateStatus::Pending])
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        // claim everything first so a concurrent handler finds nothing
        let mut claimed = Vec::new();
        for row in pending {
            let ours = self
                .store
                .set_update_status_if(
                    row.id,
                    QueuedUpdateStatus::Pending,
                    QueuedUpdateStatus::Processing,
                    None,
                )
                .await?;
            if ours {
                claimed.push(row);
            }
        }
        debug!(
            channel = %channel_address,
            claimed = claimed.len(),
            "draining queued updates"
        );

        let mut completed = 0;
        for row in claimed {
            match self.execute_queued(&row).await {
                Ok(()) => {
                    self.store
                        .set_update_status(row.id, QueuedUpdateStatus::Complete, None)
                        .await?;
                    completed += 1;
                    info!(channel = %channel_address, id = row.id, "queued update completed");
                }
                Err(err) if err.is_timeout() => {
                    // counterparty vanished again; retry on the next check-in
                    self.store
                        .set_update_status(
                            row.id,
                            QueuedUpdateStatus::Pending,
                            Some(err.to_string()),
                        )
                        .await?;
                    debug!(channel = %channel_address, id = row.id, "queued update still unreachable");
                }
                Err(err) => {
                    self.store
                        .set_update_status(
                            row.id,
                            QueuedUpdateStatus::Failed,
                            Some(err.to_string()),
                        )
                        .await?;
                    warn!(
                        channel = %channel_address,
                        id = row.id,
                        error = %err,
                        "queued update failed permanently"
                    );
                }
            }
        }
        Ok(completed)
    }

    /// Run one queued row through the engine. Liveness was just signaled,
    /// so no further probing here.
    async fn execute_queued(&self, row: &QueuedUpdate) -> Result<(), EngineError> {
        match &row.payload {
            QueuedPayload::Create(params) => {
                self.engine.create(params.clone()).await.map(|_| ())
            }
            QueuedPayload::Resolve(params) => {
                self.engine.resolve(params.clone()).await.map(|_| ())
            }
        }
    }
}
