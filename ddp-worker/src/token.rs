//! Forces the stored login token to be re-validated on startup.

use anyhow::Result;

use crate::model::DEFAULT_SESSION_ID;
use crate::store::Partition;

/// Clear the verified flag and error on the default session when it holds a
/// token that was verified (or failed) in a previous run.
///
/// Returns whether the record was reset. Errors are logged here and
/// reported as `false`.
pub fn invalidate_stale_token(partition: &Partition, server_id: &str) -> bool {
    match reset_default_session(partition) {
        Ok(reset) => {
            if reset {
                tracing::debug!(server_id, "stale session token reset");
            }
            reset
        }
        Err(e) => {
            tracing::error!(server_id, error = %e, "failed to reset session token");
            false
        }
    }
}

fn reset_default_session(partition: &Partition) -> Result<bool> {
    partition.transaction(|tx| {
        let Some(mut session) = tx.session(DEFAULT_SESSION_ID)? else {
            return Ok(false);
        };
        if !session.has_token() || !(session.token_verified || session.has_error()) {
            return Ok(false);
        }
        session.token_verified = false;
        session.error = None;
        tx.update_session(&session)?;
        Ok(true)
    })
}
