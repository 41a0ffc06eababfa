//! Revision-history resolution for rollback.

use crate::cluster::RevisionRecord;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RevisionError {
    /// First-ever deployment: nothing strictly older than the current
    /// generation exists. Permanent for this resource this cycle.
    #[error("no revision older than generation {generation}")]
    NoPriorRevision { generation: i64 },
}

/// Latest revision strictly older than the workload's current generation.
/// Revision numbers are unique per workload by collaborator construction;
/// should duplicates ever appear, the first record wins so the pick stays
/// deterministic.
pub fn previous_revision(
    history: &[RevisionRecord],
    generation: i64,
) -> Result<&RevisionRecord, RevisionError> {
    let mut best: Option<&RevisionRecord> = None;
    for record in history {
        if record.revision >= generation {
            continue;
        }
        match best {
            None => best = Some(record),
            Some(b) if record.revision > b.revision => best = Some(record),
            _ => {}
        }
    }
    best.ok_or(RevisionError::NoPriorRevision { generation })
}
