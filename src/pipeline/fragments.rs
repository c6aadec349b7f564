//! Fragment listing, ordering and reaping
//!
//! Raw fragments land in remote storage out of upload order; playback
//! order is recovered from the composite (sequence index, capture
//! timestamp) key embedded in each public id.

use crate::storage::{MediaStore, ResourceKind, StorageError};
use std::fmt;
use tracing::{info, warn};

/// Participant slot within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite playback-order key parsed from a fragment public id
///
/// Sequence index orders first; the capture timestamp breaks ties. The
/// derived lexicographic Ord is exactly that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FragmentKey {
    pub index: u64,
    pub captured_at_ms: u64,
}

/// One uploaded slice of a participant's media
#[derive(Debug, Clone)]
pub struct Fragment {
    pub public_id: String,
    /// None for malformed ids, which sort ahead of every well-formed key
    pub key: Option<FragmentKey>,
}

/// Remote prefix holding one participant's raw fragments
///
/// The chunk sub-prefix keeps raw fragments apart from the canonical
/// `final` asset, so listing and reaping can never touch a finished track.
pub fn fragment_prefix(session_id: &str, role: Role) -> String {
    format!("{}/{}/chunks/", session_id, role)
}

/// Canonical id of a participant's consolidated recording
pub fn track_public_id(session_id: &str, role: Role) -> String {
    format!("{}/{}/final", session_id, role)
}

/// Canonical id of the final composed recording
pub fn merged_public_id(session_id: &str) -> String {
    format!("{}/merged/final", session_id)
}

/// Parse the composite key from a public id of the form
/// `{session}/{role}/chunks/{index}_{captured_at_ms}`
fn parse_key(public_id: &str) -> Option<FragmentKey> {
    let segments: Vec<&str> = public_id.split('/').collect();
    let name = match segments.as_slice() {
        [_, _, _, name] => *name,
        _ => return None,
    };

    let (index, captured_at) = name.split_once('_')?;
    Some(FragmentKey {
        index: index.parse().ok()?,
        captured_at_ms: captured_at.parse().ok()?,
    })
}

/// List one participant's fragments in playback order
///
/// Empty is valid. A malformed id is kept and sorted first rather than
/// aborting the listing.
pub async fn list_fragments<S: MediaStore + ?Sized>(
    media: &S,
    session_id: &str,
    role: Role,
) -> Result<Vec<Fragment>, StorageError> {
    let prefix = fragment_prefix(session_id, role);
    let resources = media.list(ResourceKind::Video, &prefix).await?;

    let mut fragments: Vec<Fragment> = resources
        .into_iter()
        .map(|resource| {
            let key = parse_key(&resource.public_id);
            if key.is_none() {
                warn!("Malformed fragment id {:?}, sorting first", resource.public_id);
            }
            Fragment {
                public_id: resource.public_id,
                key,
            }
        })
        .collect();

    fragments.sort_by_key(|fragment| fragment.key);
    Ok(fragments)
}

/// Outcome of one best-effort reap pass
#[derive(Debug, Default)]
pub struct ReapReport {
    pub deleted: usize,
    pub failures: Vec<(Role, String)>,
}

impl ReapReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delete both roles' raw fragments after successful consolidation
///
/// Idempotent: an empty prefix deletes nothing and succeeds. A failure on
/// one role never blocks the other.
pub async fn reap_session_fragments<S: MediaStore + ?Sized>(
    media: &S,
    session_id: &str,
) -> ReapReport {
    let mut report = ReapReport::default();

    for role in [Role::Host, Role::Guest] {
        let prefix = fragment_prefix(session_id, role);
        let outcome = async {
            let resources = media.list(ResourceKind::Video, &prefix).await?;
            let ids: Vec<String> = resources
                .into_iter()
                .map(|resource| resource.public_id)
                .collect();
            let count = ids.len();
            media.delete_many(ResourceKind::Video, &ids).await?;
            Ok::<usize, StorageError>(count)
        }
        .await;

        match outcome {
            Ok(count) => {
                info!("Reaped {} raw fragments under {}", count, prefix);
                report.deleted += count;
            }
            Err(e) => {
                warn!("Failed to reap fragments under {}: {}", prefix, e);
                report.failures.push((role, e.to_string()));
            }
        }
    }

    report
}
