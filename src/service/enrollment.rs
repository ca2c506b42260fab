//! Per-connection enrollment workflow.
//!
//! A session collects single-face samples, then either commits them all under
//! one session id or leaves a cancellation mark behind so the reconciliation
//! sweep can purge anything that reached the store.
//!
//! ```text
//! Idle --start--> Collecting --finish--> Finished
//!                  |   ^  \
//!      start/image +---+   +--stop/disconnect/commit failure--> Cancelled
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::{FaceIdError, Result};
use crate::core::provider::{extract_off_thread, single_face, EmbeddingProvider};
use crate::core::recognizer::Embedding;
use crate::service::protocol::{decode_image_payload, ClientMessage, ServerMessage};
use crate::storage::{CancellationLedger, IdentityStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Collecting,
    Finished,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Finished | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Collecting => "collecting",
            Phase::Finished => "finished",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Everything a session needs from the rest of the process.
#[derive(Clone)]
pub struct EnrollmentContext {
    pub provider: Arc<dyn EmbeddingProvider>,
    pub identity: IdentityStore,
    pub ledger: CancellationLedger,
    pub min_samples: usize,
}

pub struct EnrollmentSession {
    ctx: EnrollmentContext,
    session_id: String,
    person_name: Option<String>,
    samples: Vec<Embedding>,
    phase: Phase,
}

impl EnrollmentSession {
    pub fn new(ctx: EnrollmentContext) -> Self {
        Self {
            ctx,
            session_id: Uuid::new_v4().to_string(),
            person_name: None,
            samples: Vec::new(),
            phase: Phase::Idle,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Applies one inbound message and produces the single reply for it.
    pub async fn handle(&mut self, message: ClientMessage) -> ServerMessage {
        let result = match message {
            ClientMessage::Start { name } => self.start(&name),
            ClientMessage::Image { data } => self.submit_encoded(&data).await,
            ClientMessage::Finish => self.finish().await,
            ClientMessage::Stop => self.stop().await,
        };
        result.unwrap_or_else(|e| self.reply_for(e))
    }

    /// Begins (or restarts) collection for `name`, discarding earlier samples.
    pub fn start(&mut self, name: &str) -> Result<ServerMessage> {
        self.guard(&[Phase::Idle, Phase::Collecting])?;

        let name = name.trim();
        if name.is_empty() {
            return Err(FaceIdError::Validation(
                "A name is required to start registration.".into(),
            ));
        }

        if self.phase == Phase::Collecting {
            debug!(session_id = %self.session_id, dropped = self.samples.len(), "registration restarted");
        }
        self.person_name = Some(name.to_string());
        self.samples.clear();
        self.phase = Phase::Collecting;

        info!(session_id = %self.session_id, name, "registration started");
        Ok(ServerMessage::Info {
            message: "Registration started.".into(),
            session_id: self.session_id.clone(),
        })
    }

    async fn submit_encoded(&mut self, data: &str) -> Result<ServerMessage> {
        self.guard(&[Phase::Collecting])?;
        let image = decode_image_payload(data)?;
        self.submit_sample(image).await
    }

    /// Adds the sample if it holds exactly one face. Any failure leaves the
    /// session collecting with its samples untouched.
    pub async fn submit_sample(&mut self, image: Vec<u8>) -> Result<ServerMessage> {
        self.guard(&[Phase::Collecting])?;
        if image.is_empty() {
            return Err(FaceIdError::Validation("No image data received.".into()));
        }

        let embeddings = extract_off_thread(self.ctx.provider.clone(), image).await?;
        let embedding = single_face(embeddings)?;
        self.samples.push(embedding);

        debug!(session_id = %self.session_id, count = self.samples.len(), "sample accepted");
        Ok(ServerMessage::Progress { count: self.samples.len() })
    }

    /// Commits every collected sample under this session id, or nothing.
    pub async fn finish(&mut self) -> Result<ServerMessage> {
        self.guard(&[Phase::Collecting])?;

        let name = match &self.person_name {
            Some(name) if self.samples.len() >= self.ctx.min_samples => name.clone(),
            _ => {
                return Err(FaceIdError::Validation(
                    "Not enough images or name missing.".into(),
                ))
            }
        };

        match self.ctx.ledger.is_cancelled(&self.session_id).await {
            Ok(false) => {}
            Ok(true) => {
                info!(session_id = %self.session_id, "finish refused, session already cancelled");
                self.samples.clear();
                self.phase = Phase::Cancelled;
                return Err(FaceIdError::AlreadyCancelled);
            }
            Err(e) => {
                self.abort_after_storage_failure(&e).await;
                return Err(e);
            }
        }

        match self.ctx.identity.enroll(&name, &self.session_id, &self.samples).await {
            Ok(enrolled) => {
                self.samples.clear();
                self.phase = Phase::Finished;
                info!(
                    session_id = %self.session_id,
                    person_id = %enrolled.person_id,
                    count = enrolled.count,
                    "registration complete"
                );
                Ok(ServerMessage::Done {
                    message: format!("Registered {} with {} images.", name, enrolled.count),
                    count: enrolled.count,
                })
            }
            Err(e) => {
                self.abort_after_storage_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Explicit cancellation by the client.
    pub async fn stop(&mut self) -> Result<ServerMessage> {
        self.guard(&[Phase::Collecting])?;

        self.samples.clear();
        self.phase = Phase::Cancelled;
        self.ctx.ledger.mark_cancelled(&self.session_id).await?;

        info!(session_id = %self.session_id, "registration stopped by client");
        Ok(ServerMessage::stopped("Registration cancelled and will be cleaned up."))
    }

    /// Called by the transport once the connection is gone. Only a session
    /// that was still collecting leaves a mark; later calls are no-ops.
    pub async fn on_disconnect(&mut self) {
        match self.phase {
            Phase::Idle => {
                debug!(session_id = %self.session_id, "disconnected before registration started");
            }
            Phase::Finished | Phase::Cancelled => {}
            Phase::Collecting => {
                self.samples.clear();
                self.phase = Phase::Cancelled;
                match self.ctx.ledger.mark_cancelled(&self.session_id).await {
                    Ok(_) => info!(session_id = %self.session_id, "marked registration as cancelled after disconnect"),
                    Err(e) => error!(session_id = %self.session_id, error = %e, "failed to mark registration as cancelled"),
                }
            }
        }
    }

    fn guard(&self, allowed: &[Phase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        let message = match self.phase {
            Phase::Idle => "Registration has not been started.",
            Phase::Collecting => "Registration already in progress.",
            Phase::Finished => "Registration already finished.",
            Phase::Cancelled => "Registration was cancelled.",
        };
        Err(FaceIdError::Validation(message.into()))
    }

    // The commit either never happened or its outcome is unknown; the mark
    // lets the sweep remove whatever may have landed.
    async fn abort_after_storage_failure(&mut self, cause: &FaceIdError) {
        error!(session_id = %self.session_id, error = %cause, "registration aborted by storage failure");
        self.samples.clear();
        self.phase = Phase::Cancelled;
        if let Err(e) = self.ctx.ledger.mark_cancelled(&self.session_id).await {
            warn!(session_id = %self.session_id, error = %e, "could not record cancellation");
        }
    }

    pub(crate) fn reply_for(&self, err: FaceIdError) -> ServerMessage {
        match err {
            FaceIdError::AlreadyCancelled => ServerMessage::stopped(err.to_string()),
            FaceIdError::NoFaceDetected
            | FaceIdError::MultipleFacesDetected(_)
            | FaceIdError::Validation(_) => ServerMessage::error(err.to_string()),
            FaceIdError::Image(_) | FaceIdError::Model(_) | FaceIdError::Ort(_) | FaceIdError::Transport(_) => {
                warn!(session_id = %self.session_id, error = %err, "sample rejected");
                ServerMessage::error(format!("Error processing image: {}", err))
            }
            other => ServerMessage::error(other.to_string()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::storage::test_support::{reject_embeddings_after, temp_store};

    async fn submit_faces(session: &mut EnrollmentSession, n: usize) {
        for i in 0..n {
            session.submit_sample(vec![b'a' + i as u8]).await.unwrap();
        }
    }

    #[tokio::test]
    async fn five_samples_then_finish_commits_them_all() {
        let (store, _dir) = temp_store().await;
        let mut session = EnrollmentSession::new(context(&store));

        session.start("alice").unwrap();
        submit_faces(&mut session, 5).await;
        let reply = session.finish().await.unwrap();

        assert_eq!(
            reply,
            ServerMessage::Done { message: "Registered alice with 5 images.".into(), count: 5 }
        );
        assert_eq!(session.phase(), Phase::Finished);

        let identity = store.identity();
        let alice = identity.person_by_name("alice").await.unwrap().unwrap();
        assert_eq!(identity.embedding_count_for_person(&alice.id).await.unwrap(), 5);
        assert_eq!(identity.embedding_count_for_session(session.session_id()).await.unwrap(), 5);
        assert!(!store.ledger().is_cancelled(session.session_id()).await.unwrap());
    }

    #[tokio::test]
    async fn finishing_early_is_recoverable() {
        let (store, _dir) = temp_store().await;
        let mut session = EnrollmentSession::new(context(&store));

        session.start("bob").unwrap();
        submit_faces(&mut session, 3).await;
        let err = session.finish().await.unwrap_err();
        assert!(matches!(err, FaceIdError::Validation(ref m) if m == "Not enough images or name missing."));
        assert_eq!(session.phase(), Phase::Collecting);
        assert_eq!(session.sample_count(), 3);

        submit_faces(&mut session, 2).await;
        assert!(matches!(session.finish().await.unwrap(), ServerMessage::Done { count: 5, .. }));
    }

    #[tokio::test]
    async fn rejected_samples_leave_the_count_alone() {
        let (store, _dir) = temp_store().await;
        let mut session = EnrollmentSession::new(context(&store));
        session.start("carol").unwrap();
        submit_faces(&mut session, 1).await;

        let reply = session.handle(ClientMessage::Image { data: "bm9uZQ==".into() }).await;
        assert_eq!(reply, ServerMessage::error("No face detected."));

        let err = session.submit_sample(b"two".to_vec()).await.unwrap_err();
        assert!(matches!(err, FaceIdError::MultipleFacesDetected(2)));

        let reply = session.handle(ClientMessage::Image { data: "YmFk".into() }).await;
        assert!(matches!(reply, ServerMessage::Error { ref message } if message.starts_with("Error processing image:")));

        let reply = session.handle(ClientMessage::Image { data: String::new() }).await;
        assert_eq!(reply, ServerMessage::error("No image data received."));

        assert_eq!(session.sample_count(), 1);
        assert_eq!(session.phase(), Phase::Collecting);
    }

    #[tokio::test]
    async fn stop_discards_samples_and_marks_the_session() {
        let (store, _dir) = temp_store().await;
        let mut session = EnrollmentSession::new(context(&store));
        session.start("dave").unwrap();
        submit_faces(&mut session, 5).await;

        let reply = session.handle(ClientMessage::Stop).await;
        assert_eq!(reply, ServerMessage::stopped("Registration cancelled and will be cleaned up."));
        assert_eq!(session.phase(), Phase::Cancelled);
        assert_eq!(session.sample_count(), 0);
        assert!(store.ledger().is_cancelled(session.session_id()).await.unwrap());
        assert_eq!(store.identity().embedding_count_for_session(session.session_id()).await.unwrap(), 0);

        let reply = session.handle(ClientMessage::Finish).await;
        assert_eq!(reply, ServerMessage::error("Registration was cancelled."));
    }

    #[tokio::test]
    async fn finish_after_an_external_mark_commits_nothing() {
        let (store, _dir) = temp_store().await;
        let mut session = EnrollmentSession::new(context(&store));
        session.start("erin").unwrap();
        submit_faces(&mut session, 5).await;

        store.ledger().mark_cancelled(session.session_id()).await.unwrap();
        let reply = session.handle(ClientMessage::Finish).await;

        assert_eq!(reply, ServerMessage::stopped("Registration was cancelled."));
        assert_eq!(session.phase(), Phase::Cancelled);
        assert!(store.identity().person_by_name("erin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ledger_failure_on_finish_forces_cancelled() {
        let (store, _dir) = temp_store().await;
        let mut session = EnrollmentSession::new(context(&store));
        session.start("frank").unwrap();
        submit_faces(&mut session, 5).await;

        store.close().await;
        let err = session.finish().await.unwrap_err();
        assert!(err.is_storage());
        assert_eq!(session.phase(), Phase::Cancelled);
    }

    #[tokio::test]
    async fn commit_failure_cancels_and_leaves_no_rows() {
        let (store, _dir) = temp_store().await;
        let mut session = EnrollmentSession::new(context(&store));
        session.start("gail").unwrap();
        submit_faces(&mut session, 5).await;
        reject_embeddings_after(&store, 3).await;

        let reply = session.handle(ClientMessage::Finish).await;

        assert!(matches!(reply, ServerMessage::Error { ref message } if message.starts_with("Database error")));
        assert_eq!(session.phase(), Phase::Cancelled);
        assert_eq!(session.sample_count(), 0);
        assert_eq!(store.identity().embedding_count_for_session(session.session_id()).await.unwrap(), 0);
        assert!(store.identity().person_by_name("gail").await.unwrap().is_none());
        assert!(store.ledger().is_cancelled(session.session_id()).await.unwrap());
    }

    #[tokio::test]
    async fn disconnect_marks_only_collecting_sessions_once() {
        let (store, _dir) = temp_store().await;
        let ledger = store.ledger();

        let mut idle = EnrollmentSession::new(context(&store));
        idle.on_disconnect().await;
        assert!(!ledger.is_cancelled(idle.session_id()).await.unwrap());
        assert_eq!(idle.phase(), Phase::Idle);

        let mut collecting = EnrollmentSession::new(context(&store));
        collecting.start("gina").unwrap();
        submit_faces(&mut collecting, 2).await;
        collecting.on_disconnect().await;
        collecting.on_disconnect().await;
        assert_eq!(collecting.phase(), Phase::Cancelled);
        assert_eq!(ledger.list_all_marks().await.unwrap(), vec![collecting.session_id().to_string()]);

        let mut finished = EnrollmentSession::new(context(&store));
        finished.start("hank").unwrap();
        submit_faces(&mut finished, 5).await;
        finished.finish().await.unwrap();
        finished.on_disconnect().await;
        assert!(!ledger.is_cancelled(finished.session_id()).await.unwrap());
    }

    #[tokio::test]
    async fn events_out_of_phase_are_rejected_without_transition() {
        let (store, _dir) = temp_store().await;
        let mut session = EnrollmentSession::new(context(&store));

        let reply = session.handle(ClientMessage::Image { data: "YQ==".into() }).await;
        assert_eq!(reply, ServerMessage::error("Registration has not been started."));
        assert!(session.finish().await.is_err());
        assert!(session.stop().await.is_err());
        assert_eq!(session.phase(), Phase::Idle);

        let reply = session.handle(ClientMessage::Start { name: "  ".into() }).await;
        assert_eq!(reply, ServerMessage::error("A name is required to start registration."));
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn restarting_clears_collected_samples() {
        let (store, _dir) = temp_store().await;
        let mut session = EnrollmentSession::new(context(&store));

        let first = session.handle(ClientMessage::Start { name: "ivy".into() }).await;
        submit_faces(&mut session, 3).await;
        let second = session.handle(ClientMessage::Start { name: "ivy".into() }).await;

        assert_eq!(first, second);
        assert!(matches!(second, ServerMessage::Info { ref session_id, .. } if session_id == session.session_id()));
        assert_eq!(session.sample_count(), 0);
        assert_eq!(session.phase(), Phase::Collecting);
    }
}
