//! Sync events as log lines.
//!
//! The CLI has no UI to push events to, so the emitter writes them to the
//! tracing subscriber (stderr), leaving stdout for command output.

use tally_core::Conflict;
use tally_sync::{SyncEventEmitter, SyncStatus};
use tracing::{debug, error, warn};

pub struct LogEmitter;

impl SyncEventEmitter for LogEmitter {
    fn emit_status(&self, status: &SyncStatus) {
        debug!(
            state = %status.state,
            auto_sync = status.auto_sync,
            pending_conflicts = status.pending_conflicts,
            "Sync status"
        );
    }

    fn emit_conflicts(&self, conflicts: &[Conflict]) {
        for conflict in conflicts {
            warn!(
                id = %conflict.id,
                kind = %conflict.entity_kind,
                record = %conflict.entity_id,
                field = %conflict.field,
                local = %conflict.local_value,
                cloud = %conflict.cloud_value,
                "Sync conflict"
            );
        }
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        error!(retryable, "Sync failed: {}", message);
    }

    fn emit_auth_required(&self) {
        warn!("Session expired, sign in again to resume syncing");
    }
}
