//! Keeps heartbeats under the broker's message size limit.

use super::Heartbeat;

/// Largest serialized heartbeat, in bytes. Leaves room for headers under
/// the 256 KiB SQS message limit.
pub const MAX_HEARTBEAT_SIZE: usize = 200 * 1024;

/// Entries removed per reduction step.
const REDUCTION_STEP: usize = 10;

fn encoded_len(heartbeat: &Heartbeat) -> serde_json::Result<usize> {
    serde_json::to_vec(heartbeat).map(|bytes| bytes.len())
}

/// Shrink `heartbeat` until it serializes to at most `max_size` bytes.
///
/// The oldest log entries go first, ten at a time. When no logs are left
/// the last error queues are removed, ten at a time. A heartbeat that
/// already fits is returned unchanged.
pub fn reduce_to(mut heartbeat: Heartbeat, max_size: usize) -> serde_json::Result<Heartbeat> {
    while encoded_len(&heartbeat)? > max_size && !heartbeat.logs.is_empty() {
        let drop = REDUCTION_STEP.min(heartbeat.logs.len());
        heartbeat.logs.drain(..drop);
    }

    while encoded_len(&heartbeat)? > max_size && !heartbeat.error_queues.is_empty() {
        let keep = heartbeat.error_queues.len().saturating_sub(REDUCTION_STEP);
        heartbeat.error_queues.truncate(keep);
    }

    Ok(heartbeat)
}

/// `reduce_to` with `MAX_HEARTBEAT_SIZE`.
pub fn reduce(heartbeat: Heartbeat) -> serde_json::Result<Heartbeat> {
    reduce_to(heartbeat, MAX_HEARTBEAT_SIZE)
}
