//! Recap Agent Service
//!
//! Ties the pieces together: bootstraps a session from today's lesson plan,
//! validates it on every message, runs the guard pipeline, and records the
//! turn. Turns for the same session are serialized by a per-session lock so
//! concurrent messages cannot lose `last_active` or history updates.

use crate::lesson::{LessonError, LessonPlan, LessonPlanSource};
use crate::message::Content;
use crate::pipeline::{Disposition, PipelineError, RecapPipeline, TurnOutcome};
use crate::prompt::RecapPrompt;
use crate::session::{DEFAULT_SESSION_TIMEOUT, Session, SessionState, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const APP_NAME: &str = "ai_teaching_assistant";

/// Persistence for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> anyhow::Result<()>;
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Session>>;
    async fn save(&self, session: &Session) -> anyhow::Result<()>;
}

/// Process-local session storage.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &Session) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            anyhow::bail!("session {} already exists", session.id);
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Session>> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn save(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }
}

type LockMap = HashMap<Uuid, Arc<Mutex<()>>>;

/// One async mutex per session id. An entry lives only while some caller
/// holds or waits for it.
#[derive(Default)]
pub struct SessionLocks {
    locks: Arc<StdMutex<LockMap>>,
}

impl SessionLocks {
    /// Waits for exclusive access to session `id`.
    pub async fn acquire(&self, id: Uuid) -> SessionGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id).or_default().clone()
        };
        // Registered before awaiting so a cancelled waiter still cleans up.
        let mut guard = SessionGuard {
            id,
            held: None,
            locks: self.locks.clone(),
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Exclusive access to one session. Dropping the last guard for an id
/// removes its map entry.
pub struct SessionGuard {
    id: Uuid,
    held: Option<OwnedMutexGuard<()>>,
    locks: Arc<StdMutex<LockMap>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.held.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // The map's own reference is the only one left once nobody holds or waits.
        if locks.get(&self.id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.id);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("No lesson plan for {0}; cannot start a recap session")]
    NoLessonToday(NaiveDate),
    #[error("Session {0} has expired; start a new session")]
    SessionExpired(Uuid),
    #[error("Session {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Lesson(#[from] LessonError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("Session store failed: {0}")]
    Store(#[from] anyhow::Error),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Pipeline(e) if e.is_retryable())
    }
}

pub struct RecapAgent {
    store: Arc<dyn SessionStore>,
    lessons: Arc<dyn LessonPlanSource>,
    prompt: RecapPrompt,
    pipeline: RecapPipeline,
    locks: SessionLocks,
    session_timeout: Duration,
    app_name: String,
}

impl RecapAgent {
    pub fn new(
        store: Arc<dyn SessionStore>,
        lessons: Arc<dyn LessonPlanSource>,
        prompt: RecapPrompt,
        pipeline: RecapPipeline,
    ) -> Self {
        Self {
            store,
            lessons,
            prompt,
            pipeline,
            locks: SessionLocks::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            app_name: APP_NAME.to_string(),
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// The lesson plan for `today`. A missing row is fatal for session start.
    pub async fn today_lesson(&self, today: NaiveDate) -> Result<LessonPlan, AgentError> {
        self.lessons
            .lesson_for(today)
            .await?
            .ok_or(AgentError::NoLessonToday(today))
    }

    /// Starts a new session scoped to the lesson taught on the local date of `now`.
    #[instrument(skip(self, now), fields(session_id))]
    pub async fn start_session(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AgentError> {
        let today = now.with_timezone(&Local).date_naive();
        let lesson = self.today_lesson(today).await?;
        let instruction = self.prompt.render(&lesson);

        let state = SessionState {
            topic: lesson.topic,
            class_name: lesson.class_name,
            teacher: lesson.teacher,
            subject: lesson.subject,
            lesson_date: lesson.date,
            last_active: Some(now),
        };
        let session = Session::new(user_id, &self.app_name, state, instruction, now);
        self.store.create(&session).await?;

        tracing::Span::current().record("session_id", tracing::field::display(session.id));
        info!(topic = %session.state.topic, "Recap session started");
        Ok(session)
    }

    async fn load_owned(&self, id: Uuid, user_id: &str) -> Result<Session, AgentError> {
        self.store
            .get(id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or(AgentError::NotFound(id))
    }

    /// Marks `session` expired and persists it if it has timed out.
    /// Returns whether the session is expired.
    async fn settle_expiry(
        &self,
        session: &mut Session,
        now: DateTime<Utc>,
    ) -> Result<bool, AgentError> {
        if !session.is_expired_at(now, self.session_timeout) {
            return Ok(false);
        }
        if session.status != SessionStatus::Expired {
            session.expire();
            self.store.save(session).await?;
            info!(session_id = %session.id, "Session expired");
        }
        Ok(true)
    }

    /// Fetches a session, reporting it as expired once it has timed out.
    pub async fn get_session(
        &self,
        id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AgentError> {
        let _guard = self.locks.acquire(id).await;
        let mut session = self.load_owned(id, user_id).await?;
        self.settle_expiry(&mut session, now).await?;
        Ok(session)
    }

    /// Handles one student message end to end.
    #[instrument(skip(self, id, text, now), fields(session_id = %id))]
    pub async fn send_message(
        &self,
        id: Uuid,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<TurnOutcome, AgentError> {
        let _guard = self.locks.acquire(id).await;
        let mut session = self.load_owned(id, user_id).await?;

        if self.settle_expiry(&mut session, now).await? {
            warn!("Message for expired session rejected");
            return Err(AgentError::SessionExpired(id));
        }

        let outcome = self
            .pipeline
            .run_turn(&session.instruction, &session.history, text)
            .await?;

        match outcome.disposition {
            // The rejected text must never become model history.
            Disposition::InputRejected => {}
            Disposition::Answered | Disposition::OutputRejected | Disposition::Blocked => {
                session.history.push(Content::user(text));
                session.history.push(outcome.reply.clone());
            }
        }
        session.touch(now);
        self.store.save(&session).await?;

        info!(disposition = ?outcome.disposition, turns = session.history.len() / 2, "Message handled");
        Ok(outcome)
    }
}
