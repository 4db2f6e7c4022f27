// ============================================================================
// Database Transaction Manager
// ============================================================================

use super::attribute::{Propagation, TransactionAttribute};
use super::event::{
    EntityChangeEvent, EntityChangeEventBroadcaster, EntityChangeEventType, LoggingEventBroadcaster,
};
use super::frame::{FrameId, TransactionFrame};
use crate::config::TransactionConfig;
use crate::core::{DbError, ErrorCode, Result};
use crate::database::{Database, DatabaseId};
use crate::session::DatabaseSession;
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

tokio::task_local! {
    static TRANSACTION_STACK: RefCell<Vec<TransactionFrame>>;
}

fn with_stack<R>(f: impl FnOnce(&mut Vec<TransactionFrame>) -> Result<R>) -> Result<R> {
    match TRANSACTION_STACK.try_with(|cell| f(&mut cell.borrow_mut())) {
        Ok(result) => result,
        Err(_) => Err(DbError::coded(
            ErrorCode::TransactionScopeRequired,
            "Transaction stack is only available inside DatabaseTransactionManager::scope",
        )),
    }
}

fn no_active_frame() -> DbError {
    DbError::coded(ErrorCode::TransactionIsRequired, "No active transaction frame")
}

fn with_top<R>(f: impl FnOnce(&mut TransactionFrame) -> Result<R>) -> Result<R> {
    with_stack(|stack| f(stack.last_mut().ok_or_else(no_active_frame)?))
}

fn with_frame<R>(frame_id: FrameId, f: impl FnOnce(&mut TransactionFrame) -> R) -> Result<Option<R>> {
    with_stack(|stack| Ok(stack.iter_mut().rev().find(|frame| frame.id() == frame_id).map(f)))
}

fn top_sessions() -> Result<(FrameId, Vec<Arc<dyn DatabaseSession>>)> {
    with_top(|frame| {
        let sessions = frame.sessions().iter().map(|(_, s)| Arc::clone(s)).collect();
        Ok((frame.id(), sessions))
    })
}

enum Join {
    Added,
    Raced(Arc<dyn DatabaseSession>),
    FrameGone,
}

/// Drives transaction propagation over a per-task stack of frames.
///
/// Every `begin_transaction*` must be matched by one `end_transaction`. The
/// stack lives in a task-local established by [`scope`](Self::scope); using
/// it outside a scope fails with `TRANSACTION_SCOPE_REQUIRED`.
pub struct DatabaseTransactionManager {
    config: TransactionConfig,
    broadcaster: Arc<dyn EntityChangeEventBroadcaster>,
}

impl Default for DatabaseTransactionManager {
    fn default() -> Self {
        Self::new(TransactionConfig::default())
    }
}

impl DatabaseTransactionManager {
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            config,
            broadcaster: Arc::new(LoggingEventBroadcaster),
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn EntityChangeEventBroadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Run `fut` with a transaction stack. Nested scopes share the outer
    /// stack.
    pub async fn scope<F: Future>(fut: F) -> F::Output {
        if TRANSACTION_STACK.try_with(|_| ()).is_ok() {
            return fut.await;
        }
        TRANSACTION_STACK
            .scope(RefCell::new(Vec::new()), async move {
                let output = fut.await;
                let leftover = TRANSACTION_STACK.with(|cell| cell.borrow().len());
                if leftover > 0 {
                    warn!(frames = leftover, "Transaction scope ended with unfinished frames");
                }
                output
            })
            .await
    }

    /// Bracket `fut` with `begin_transaction_with(attribute)` and
    /// `end_transaction`, flagging the frame for rollback when `fut` fails.
    pub async fn transactional<T, F>(&self, attribute: TransactionAttribute, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        Self::scope(async {
            self.begin_transaction_with(attribute)?;
            let result = fut.await;
            if result.is_err() {
                self.set_rollback()?;
            }
            let ended = self.end_transaction().await;
            let value = result?;
            ended?;
            Ok(value)
        })
        .await
    }

    pub fn begin_transaction(&self) -> Result<()> {
        self.begin_transaction_with(TransactionAttribute::default())
    }

    pub fn begin_transaction_with(&self, attribute: TransactionAttribute) -> Result<()> {
        with_stack(|stack| {
            let top = stack.last().map(TransactionFrame::kind);
            match attribute.resolve(top)? {
                Propagation::NewFrame(kind) => {
                    let mut frame = TransactionFrame::new(kind);
                    frame.enter();
                    debug!(frame = %frame.id(), ?kind, %attribute, stack = stack.len() + 1, "Pushed transaction frame");
                    stack.push(frame);
                }
                Propagation::ReuseTop => {
                    let frame = stack.last_mut().ok_or_else(no_active_frame)?;
                    frame.enter();
                    debug!(frame = %frame.id(), depth = frame.depth(), %attribute, "Reused transaction frame");
                }
            }
            Ok(())
        })
    }

    /// Leave the current frame. When its depth reaches zero every joined
    /// session is committed (or rolled back) and closed, then the pending
    /// entity events are broadcast.
    pub async fn end_transaction(&self) -> Result<()> {
        let finished = with_stack(|stack| {
            let frame = stack.last_mut().ok_or_else(|| {
                DbError::coded(
                    ErrorCode::TransactionIsAlreadyCompleted,
                    "end_transaction called without a matching begin_transaction",
                )
            })?;
            if frame.exit() {
                Ok(stack.pop())
            } else {
                debug!(frame = %frame.id(), depth = frame.depth(), "Left nested transaction scope");
                Ok(None)
            }
        })?;

        if let Some(frame) = finished {
            self.complete_frame(frame).await;
        }
        Ok(())
    }

    async fn complete_frame(&self, frame: TransactionFrame) {
        let frame_id = frame.id();
        let (sessions, events, rollback) = frame.into_parts();

        finish_sessions(frame_id, &sessions, rollback).await;
        for (database, session) in &sessions {
            if let Err(err) = session.close().await {
                warn!(frame = %frame_id, %database, error = %err, "Failed to close session; continuing teardown");
            }
        }
        for event in &events {
            if let Err(err) = self.broadcaster.broadcast_entity_change(event).await {
                warn!(frame = %frame_id, entity = %event.entity, error = %err, "Failed to broadcast entity change");
            }
        }

        debug!(
            frame = %frame_id,
            sessions = sessions.len(),
            events = events.len(),
            rollback,
            "Completed transaction frame"
        );
    }

    /// True when the top frame is a real transaction. False outside a scope.
    pub fn is_transaction_open(&self) -> bool {
        with_stack(|stack| Ok(stack.last().is_some_and(TransactionFrame::is_transaction)))
            .unwrap_or(false)
    }

    /// Depth of the top frame, zero when there is none.
    pub fn current_depth(&self) -> usize {
        with_stack(|stack| Ok(stack.last().map_or(0, TransactionFrame::depth))).unwrap_or(0)
    }

    /// Number of frames on the stack.
    pub fn stack_size(&self) -> usize {
        with_stack(|stack| Ok(stack.len())).unwrap_or(0)
    }

    pub fn is_rollback(&self) -> Result<bool> {
        with_top(|frame| Ok(frame.is_rollback()))
    }

    /// Session of `database` in the top frame, created on first use.
    pub async fn join_transaction(&self, database: &Database) -> Result<Arc<dyn DatabaseSession>> {
        let database_id = database.id();
        let (frame_id, existing) =
            with_top(|frame| Ok((frame.id(), frame.session(database_id).cloned())))?;
        if let Some(session) = existing {
            return Ok(session);
        }

        let session = database.create_database_session().await?;
        let joined = with_frame(frame_id, |frame| match frame.session(database_id) {
            Some(existing) => Join::Raced(Arc::clone(existing)),
            None => {
                frame.add_session(database_id, Arc::clone(&session));
                Join::Added
            }
        })?
        .unwrap_or(Join::FrameGone);

        match joined {
            Join::Added => {
                debug!(frame = %frame_id, database = %database_id, data_source = database.name(), "Joined database");
                Ok(session)
            }
            Join::Raced(existing) => {
                close_quietly(database_id, &session).await;
                Ok(existing)
            }
            Join::FrameGone => {
                close_quietly(database_id, &session).await;
                Err(DbError::InvalidState(format!(
                    "Transaction frame {} completed while joining {}",
                    frame_id, database_id
                )))
            }
        }
    }

    /// Session of `database` for the current transaction.
    pub async fn get_database_session(&self, database: &Database) -> Result<Arc<dyn DatabaseSession>> {
        let (is_transaction, existing) =
            with_top(|frame| Ok((frame.is_transaction(), frame.session(database.id()).cloned())))?;
        if !is_transaction {
            return Err(DbError::coded(
                ErrorCode::TransactionIsRequired,
                format!("Database '{}' used outside a transaction", database.name()),
            ));
        }
        if let Some(session) = existing {
            return Ok(session);
        }
        if !self.config.auto_join {
            return Err(DbError::coded(
                ErrorCode::DatabaseNotPartOfTransaction,
                format!("Database '{}' has not joined the transaction", database.name()),
            ));
        }
        self.join_transaction(database).await
    }

    pub async fn set_save_point(&self) -> Result<()> {
        let (frame_id, sessions) = top_sessions()?;
        for session in &sessions {
            session.set_savepoint().await?;
        }
        debug!(frame = %frame_id, sessions = sessions.len(), "Set save point");
        Ok(())
    }

    pub async fn clear_save_point(&self) -> Result<()> {
        let (frame_id, sessions) = top_sessions()?;
        for session in &sessions {
            session.clear_savepoint().await?;
        }
        debug!(frame = %frame_id, sessions = sessions.len(), "Cleared save point");
        Ok(())
    }

    /// Roll every joined session back to its last save point and clear the
    /// frame's rollback flag.
    pub async fn rollback_to_save_point(&self) -> Result<()> {
        let (frame_id, sessions) = top_sessions()?;
        for session in &sessions {
            session.rollback_to_savepoint().await?;
        }
        with_frame(frame_id, |frame| frame.set_rollback(false))?;
        debug!(frame = %frame_id, sessions = sessions.len(), "Rolled back to save point");
        Ok(())
    }

    pub fn set_rollback(&self) -> Result<()> {
        with_top(|frame| {
            frame.set_rollback(true);
            Ok(())
        })
    }

    pub fn clear_rollback(&self) -> Result<()> {
        with_top(|frame| {
            frame.set_rollback(false);
            Ok(())
        })
    }

    /// Commit (or roll back, when flagged) the top frame's sessions without
    /// closing them, then reset the rollback flag.
    pub async fn commit(&self) -> Result<()> {
        let (frame_id, sessions, rollback) = with_top(|frame| {
            let sessions: Vec<_> = frame.sessions().to_vec();
            Ok((frame.id(), sessions, frame.is_rollback()))
        })?;
        finish_sessions(frame_id, &sessions, rollback).await;
        with_frame(frame_id, |frame| frame.set_rollback(!frame.is_transaction()))?;
        Ok(())
    }

    /// Record an entity change on the top frame. It is broadcast when the
    /// outermost frame completes.
    pub fn set_off_entity_event(
        &self,
        event_type: EntityChangeEventType,
        entity: &str,
        id: Option<i64>,
    ) -> Result<()> {
        let event = EntityChangeEvent::new(event_type, &self.config.source_client_id, entity, id);
        with_top(|frame| {
            frame.push_event(event);
            Ok(())
        })
    }
}

async fn finish_sessions(
    frame_id: FrameId,
    sessions: &[(DatabaseId, Arc<dyn DatabaseSession>)],
    rollback: bool,
) {
    for (database, session) in sessions {
        let outcome = if rollback {
            session.rollback().await
        } else {
            session.commit().await
        };
        if let Err(err) = outcome {
            warn!(frame = %frame_id, %database, rollback, error = %err, "Failed to finish session; continuing teardown");
        }
    }
}

async fn close_quietly(database: DatabaseId, session: &Arc<dyn DatabaseSession>) {
    if let Err(err) = session.close().await {
        warn!(%database, error = %err, "Failed to close redundant session");
    }
}
