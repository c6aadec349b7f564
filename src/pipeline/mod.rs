//! Post-call consolidation pipeline
//!
//! Sequences concatenation, composition, persistence and fragment reaping
//! for one finished session, returning a structured report to the caller.

pub mod compose;
pub mod concat;
pub mod fragments;
pub mod visibility;

use crate::config::{Config, PollPolicy};
use crate::database::{DatabaseError, SessionStore};
use crate::pipeline::fragments::Role;
use crate::storage::{MediaStore, StorageError};
use crate::transcode::{TranscodeError, Transcoder};
use dashmap::DashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("insufficient fragments for {role}: found {found}, need at least 2")]
    InsufficientFragments { role: Role, found: usize },
    #[error("fragment {0} never became visible in remote storage")]
    FragmentNeverVisible(String),
    #[error("no completed {0} recording in remote storage")]
    MissingRecording(Role),
    #[error("session {0} already has a pipeline run in flight")]
    AlreadyRunning(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("transcode error: {0}")]
    Transcode(#[from] TranscodeError),
    #[error("session store error: {0}")]
    Database(#[from] DatabaseError),
}

/// Stages of one pipeline run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    ConcatenatingHost,
    ConcatenatingGuest,
    AwaitingConsistency,
    Composing,
    Persisting,
    Reaping,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Idle => "idle",
            PipelineStage::ConcatenatingHost => "concatenating-host",
            PipelineStage::ConcatenatingGuest => "concatenating-guest",
            PipelineStage::AwaitingConsistency => "awaiting-consistency",
            PipelineStage::Composing => "composing",
            PipelineStage::Persisting => "persisting",
            PipelineStage::Reaping => "reaping",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks and logs stage transitions for one session run
struct StageTracker<'a> {
    session_id: &'a str,
    stage: PipelineStage,
}

impl<'a> StageTracker<'a> {
    fn new(session_id: &'a str) -> Self {
        Self {
            session_id,
            stage: PipelineStage::Idle,
        }
    }

    fn advance(&mut self, next: PipelineStage) {
        info!("[{}] {} -> {}", self.session_id, self.stage, next);
        self.stage = next;
    }

    fn fail(&mut self, err: &PipelineError) {
        error!(
            "[{}] {} -> {}: {}",
            self.session_id,
            self.stage,
            PipelineStage::Failed,
            err
        );
        self.stage = PipelineStage::Failed;
    }
}

/// Durable outputs of one successful pipeline run
#[derive(Debug, Clone)]
pub struct SessionRecordings {
    pub session_id: String,
    pub host_track_url: String,
    pub guest_track_url: String,
    pub merged_url: String,
    /// Raw fragments removed during best-effort reaping
    pub reaped_fragments: usize,
    /// Reaping failures; never fatal once the URLs are persisted
    pub reap_failures: Vec<String>,
}

/// Settings the orchestrator needs beyond its collaborators
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub poll: PollPolicy,
    pub consistency_pause: Duration,
    pub scratch_dir: PathBuf,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll: config.poll.clone(),
            consistency_pause: config.consistency_pause,
            scratch_dir: config.scratch_dir.clone(),
        }
    }
}

/// Sequences all consolidation stages for finished sessions
pub struct Pipeline<S, T> {
    media: Arc<S>,
    transcoder: Arc<T>,
    sessions: Arc<SessionStore>,
    settings: PipelineSettings,
}

impl<S: MediaStore, T: Transcoder> Pipeline<S, T> {
    pub fn new(
        media: Arc<S>,
        transcoder: Arc<T>,
        sessions: Arc<SessionStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            media,
            transcoder,
            sessions,
            settings,
        }
    }

    /// Consolidate one finished session
    ///
    /// Stages run strictly in order; the first failure aborts the run and
    /// nothing is persisted. Re-invocation is idempotent because every
    /// stage writes to canonical, overwriting identifiers.
    pub async fn process_session(
        &self,
        session_id: &str,
    ) -> Result<SessionRecordings, PipelineError> {
        let mut tracker = StageTracker::new(session_id);
        let result = self.run_stages(&mut tracker, session_id).await;
        match &result {
            Ok(recordings) => info!(
                "[{}] Consolidation complete: {}",
                session_id, recordings.merged_url
            ),
            Err(e) => tracker.fail(e),
        }
        result
    }

    async fn run_stages(
        &self,
        tracker: &mut StageTracker<'_>,
        session_id: &str,
    ) -> Result<SessionRecordings, PipelineError> {
        let media = self.media.as_ref();

        let session = self.sessions.get_session(session_id)?.ok_or_else(|| {
            PipelineError::Database(DatabaseError::SessionNotFound(session_id.to_string()))
        })?;
        info!("[{}] Consolidating {:?}", session_id, session.title);

        // Check both rosters up front so a doomed run uploads nothing
        for role in [Role::Host, Role::Guest] {
            let found = fragments::list_fragments(media, session_id, role).await?.len();
            if found < concat::MIN_FRAGMENTS {
                return Err(PipelineError::InsufficientFragments { role, found });
            }
        }

        tracker.advance(PipelineStage::ConcatenatingHost);
        let host_track_url =
            concat::concatenate_track(media, session_id, Role::Host, &self.settings.poll).await?;

        tracker.advance(PipelineStage::ConcatenatingGuest);
        let guest_track_url =
            concat::concatenate_track(media, session_id, Role::Guest, &self.settings.poll).await?;

        // Let the freshly written tracks settle before they are read back
        tracker.advance(PipelineStage::AwaitingConsistency);
        tokio::time::sleep(self.settings.consistency_pause).await;

        tracker.advance(PipelineStage::Composing);
        let merged_url = compose::compose_session(
            media,
            self.transcoder.as_ref(),
            session_id,
            &self.settings.scratch_dir,
            &self.settings.poll,
        )
        .await?;

        tracker.advance(PipelineStage::Persisting);
        self.sessions
            .update_recording_urls(session_id, &host_track_url, &guest_track_url, &merged_url)?;

        tracker.advance(PipelineStage::Reaping);
        let reap = fragments::reap_session_fragments(media, session_id).await;

        tracker.advance(PipelineStage::Done);
        Ok(SessionRecordings {
            session_id: session_id.to_string(),
            host_track_url,
            guest_track_url,
            merged_url,
            reaped_fragments: reap.deleted,
            reap_failures: reap
                .failures
                .into_iter()
                .map(|(role, e)| format!("{}: {}", role, e))
                .collect(),
        })
    }
}

/// At-most-one concurrent run per session id
///
/// Canonical overwriting makes re-runs idempotent, but two simultaneous
/// runs for the same session would race on the same identifiers.
pub struct PipelineRunner<S, T> {
    pipeline: Arc<Pipeline<S, T>>,
    in_flight: DashMap<String, ()>,
}

impl<S: MediaStore, T: Transcoder> PipelineRunner<S, T> {
    pub fn new(pipeline: Arc<Pipeline<S, T>>) -> Self {
        Self {
            pipeline,
            in_flight: DashMap::new(),
        }
    }

    pub async fn run(&self, session_id: &str) -> Result<SessionRecordings, PipelineError> {
        match self.in_flight.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(PipelineError::AlreadyRunning(session_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
            }
        }

        let result = self.pipeline.process_session(session_id).await;
        self.in_flight.remove(session_id);
        result
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{FakeStore, FakeTranscoder};
    use super::*;
    use crate::database::Session;
    use tempfile::tempdir;

    fn test_settings(scratch: &std::path::Path) -> PipelineSettings {
        PipelineSettings {
            poll: PollPolicy {
                attempts: 3,
                delay: Duration::ZERO,
            },
            consistency_pause: Duration::ZERO,
            scratch_dir: scratch.to_path_buf(),
        }
    }

    fn seed_session(store: &SessionStore, session_id: &str) {
        store
            .create_session(&Session {
                session_id: session_id.to_string(),
                title: "Weekly interview".to_string(),
                host_name: "ada".to_string(),
                guest_name: Some("grace".to_string()),
                scheduled_at: None,
                is_live: true,
                host_track_url: None,
                guest_track_url: None,
                merged_url: None,
            })
            .unwrap();
    }

    fn seed_fragments(media: &FakeStore, session_id: &str) {
        for role in [Role::Host, Role::Guest] {
            media.add_fragment(session_id, role, 0, 100);
            media.add_fragment(session_id, role, 1, 200);
        }
    }

    fn build_pipeline(
        media: &Arc<FakeStore>,
        transcoder: Arc<FakeTranscoder>,
        scratch: &std::path::Path,
    ) -> (Pipeline<FakeStore, FakeTranscoder>, Arc<SessionStore>) {
        let sessions = Arc::new(SessionStore::open(":memory:").unwrap());
        let pipeline = Pipeline::new(
            media.clone(),
            transcoder,
            sessions.clone(),
            test_settings(scratch),
        );
        (pipeline, sessions)
    }

    #[tokio::test]
    async fn consolidates_and_persists_all_three_urls() {
        let scratch = tempdir().unwrap();
        let media = Arc::new(FakeStore::new());
        seed_fragments(&media, "sess1");
        let (pipeline, sessions) =
            build_pipeline(&media, Arc::new(FakeTranscoder::new()), scratch.path());
        seed_session(&sessions, "sess1");

        let recordings = pipeline.process_session("sess1").await.unwrap();

        assert_eq!(
            recordings.host_track_url,
            "https://fake.media/sess1/host/final.mp4"
        );
        assert_eq!(
            recordings.guest_track_url,
            "https://fake.media/sess1/guest/final.mp4"
        );
        assert_eq!(
            recordings.merged_url,
            "https://fake.media/sess1/merged/final.mp4"
        );
        assert_eq!(recordings.reaped_fragments, 4);
        assert!(recordings.reap_failures.is_empty());

        let row = sessions.get_session("sess1").unwrap().unwrap();
        assert_eq!(
            row.host_track_url.as_deref(),
            Some("https://fake.media/sess1/host/final.mp4")
        );
        assert_eq!(
            row.merged_url.as_deref(),
            Some("https://fake.media/sess1/merged/final.mp4")
        );
        assert!(!row.is_live);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn single_guest_fragment_fails_fast_without_uploads() {
        let scratch = tempdir().unwrap();
        let media = Arc::new(FakeStore::new());
        media.add_fragment("sess1", Role::Host, 0, 100);
        media.add_fragment("sess1", Role::Host, 1, 200);
        media.add_fragment("sess1", Role::Guest, 0, 100);
        let (pipeline, sessions) =
            build_pipeline(&media, Arc::new(FakeTranscoder::new()), scratch.path());
        seed_session(&sessions, "sess1");

        let err = pipeline.process_session("sess1").await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::InsufficientFragments {
                role: Role::Guest,
                found: 1
            }
        ));
        assert!(media.uploads().is_empty());
        let row = sessions.get_session("sess1").unwrap().unwrap();
        assert!(row.merged_url.is_none());
    }

    #[tokio::test]
    async fn rerun_yields_identical_urls_and_clean_reap_reporting() {
        let scratch = tempdir().unwrap();
        let media = Arc::new(FakeStore::new());
        seed_fragments(&media, "sess1");
        // Keep the fragment set identical across runs
        media.fail_deletes_under("");
        let (pipeline, sessions) =
            build_pipeline(&media, Arc::new(FakeTranscoder::new()), scratch.path());
        seed_session(&sessions, "sess1");

        let first = pipeline.process_session("sess1").await.unwrap();
        let second = pipeline.process_session("sess1").await.unwrap();

        assert_eq!(first.host_track_url, second.host_track_url);
        assert_eq!(first.guest_track_url, second.guest_track_url);
        assert_eq!(first.merged_url, second.merged_url);
        // Reap failures are reported per run, never accumulated
        assert_eq!(first.reap_failures.len(), 2);
        assert_eq!(second.reap_failures.len(), 2);

        // Best-effort reaping still left the persisted URLs in place
        let row = sessions.get_session("sess1").unwrap().unwrap();
        assert_eq!(row.merged_url.as_deref(), Some(second.merged_url.as_str()));
    }

    #[tokio::test]
    async fn compositor_failure_persists_nothing() {
        let scratch = tempdir().unwrap();
        let media = Arc::new(FakeStore::new());
        seed_fragments(&media, "sess1");
        let (pipeline, sessions) =
            build_pipeline(&media, Arc::new(FakeTranscoder::failing()), scratch.path());
        seed_session(&sessions, "sess1");

        let err = pipeline.process_session("sess1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Transcode(_)));

        // Both concatenations happened, but the record shows no output
        assert_eq!(media.uploads().len(), 2);
        let row = sessions.get_session("sess1").unwrap().unwrap();
        assert!(row.host_track_url.is_none());
        assert!(row.guest_track_url.is_none());
        assert!(row.merged_url.is_none());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unknown_session_fails_before_any_storage_work() {
        let scratch = tempdir().unwrap();
        let media = Arc::new(FakeStore::new());
        seed_fragments(&media, "sess1");
        let (pipeline, _sessions) =
            build_pipeline(&media, Arc::new(FakeTranscoder::new()), scratch.path());

        let err = pipeline.process_session("sess1").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Database(DatabaseError::SessionNotFound(_))
        ));
        assert!(media.uploads().is_empty());
    }

    #[tokio::test]
    async fn duplicate_concurrent_run_is_rejected() {
        let scratch = tempdir().unwrap();
        let media = Arc::new(FakeStore::new());
        seed_fragments(&media, "sess1");
        // Keep fragments in place so the rerun below has work to do
        media.fail_deletes_under("");
        let sessions = Arc::new(SessionStore::open(":memory:").unwrap());
        seed_session(&sessions, "sess1");

        let mut settings = test_settings(scratch.path());
        settings.consistency_pause = Duration::from_millis(250);
        let pipeline = Arc::new(Pipeline::new(
            media.clone(),
            Arc::new(FakeTranscoder::new()),
            sessions,
            settings,
        ));
        let runner = Arc::new(PipelineRunner::new(pipeline));

        let background = runner.clone();
        let first = tokio::spawn(async move { background.run("sess1").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = runner.run("sess1").await;
        assert!(matches!(second, Err(PipelineError::AlreadyRunning(_))));

        first.await.unwrap().unwrap();

        // Once the first run finishes, the guard clears
        let rerun = runner.run("sess1").await;
        assert!(rerun.is_ok());
    }
}
