//! Log ordering
//!
//! Build and run logs are delivered in pages that may arrive out of order and
//! may overlap. Every consumer orders lines by `(timestamp, insert_id)`.

use crate::types::LogItem;

/// Sort logs in place by timestamp, then insert id
pub fn sort_logs(logs: &mut [LogItem]) {
    logs.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.insert_id.cmp(&b.insert_id))
    });
}
