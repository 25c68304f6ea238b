//! Merge-reduce of join inputs.

use crate::core::{DataRequest, GatewayResult};
use crate::request_error;

/// Combines predecessor payloads, given in arrival order, into one.
///
/// Documents are folded position by position; a later arrival overwrites
/// every field it populates. Request metadata comes from the first arrival.
pub fn merge_reduce(mut arrivals: Vec<DataRequest>) -> GatewayResult<DataRequest> {
    if arrivals.is_empty() {
        return Err(request_error!("nothing to merge"));
    }
    let mut merged = arrivals.remove(0);
    if arrivals.is_empty() {
        return Ok(merged);
    }

    let expected = merged.docs.len();
    if let Some(other) = arrivals.iter().find(|r| r.docs.len() != expected) {
        return Err(request_error!(
            "item count mismatch at merge: {} vs {} documents",
            expected,
            other.docs.len()
        ));
    }

    for later in arrivals {
        for (doc, later_doc) in merged.docs.iter_mut().zip(later.docs) {
            doc.overwrite_from(later_doc);
        }
    }
    Ok(merged)
}
