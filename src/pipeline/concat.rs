//! Track concatenation
//!
//! Fuses one participant's ordered fragments into a single continuous
//! recording through the remote transformation service.

use crate::config::PollPolicy;
use crate::pipeline::fragments::{self, Role};
use crate::pipeline::visibility::await_visibility;
use crate::pipeline::PipelineError;
use crate::storage::{MediaStore, ResourceKind, SpliceChain};
use tracing::info;

/// Minimum fragments required to build a splice chain
pub const MIN_FRAGMENTS: usize = 2;

/// Consolidate one participant's raw fragments into the canonical
/// per-participant recording, overwriting any previous run's output
pub async fn concatenate_track<S: MediaStore + ?Sized>(
    media: &S,
    session_id: &str,
    role: Role,
    poll: &PollPolicy,
) -> Result<String, PipelineError> {
    let fragments = fragments::list_fragments(media, session_id, role).await?;
    if fragments.len() < MIN_FRAGMENTS {
        return Err(PipelineError::InsufficientFragments {
            role,
            found: fragments.len(),
        });
    }

    info!(
        "[{}] Concatenating {} {} fragments",
        session_id,
        fragments.len(),
        role
    );

    // A still-propagating fragment must not be referenced by the splice
    // request; wait for every one of them first.
    for fragment in &fragments {
        let status =
            await_visibility(media, ResourceKind::Video, &fragment.public_id, poll).await?;
        if !status.exists {
            return Err(PipelineError::FragmentNeverVisible(
                fragment.public_id.clone(),
            ));
        }
    }

    let ids: Vec<String> = fragments.into_iter().map(|f| f.public_id).collect();
    let chain = SpliceChain::from_ordered_ids(&ids).ok_or(PipelineError::InsufficientFragments {
        role,
        found: ids.len(),
    })?;

    let target_id = fragments::track_public_id(session_id, role);
    let asset = media.upload_spliced(&chain, &target_id).await?;
    info!("[{}] {} track stored at {}", session_id, role, asset.secure_url);
    Ok(asset.secure_url)
}
