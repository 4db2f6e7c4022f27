use super::event::EntityChangeEvent;
use crate::database::DatabaseId;
use crate::session::DatabaseSession;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl FrameId {
    fn new() -> Self {
        FrameId(NEXT_FRAME_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// A real transaction; sessions are committed unless rolled back.
    Transaction,
    /// Non-transactional scope; anything joined into it is rolled back.
    PassThrough,
}

/// One propagation scope on the transaction stack.
pub struct TransactionFrame {
    id: FrameId,
    kind: FrameKind,
    rollback: bool,
    depth: usize,
    sessions: Vec<(DatabaseId, Arc<dyn DatabaseSession>)>,
    pending_events: Vec<EntityChangeEvent>,
}

impl TransactionFrame {
    pub fn new(kind: FrameKind) -> Self {
        Self {
            id: FrameId::new(),
            kind,
            rollback: kind == FrameKind::PassThrough,
            depth: 0,
            sessions: Vec::new(),
            pending_events: Vec::new(),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_transaction(&self) -> bool {
        self.kind == FrameKind::Transaction
    }

    pub fn is_rollback(&self) -> bool {
        self.rollback
    }

    pub fn set_rollback(&mut self, rollback: bool) {
        self.rollback = rollback;
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn enter(&mut self) {
        self.depth += 1;
    }

    /// Decrement the depth; true when the frame is finished.
    pub(crate) fn exit(&mut self) -> bool {
        self.depth = self.depth.saturating_sub(1);
        self.depth == 0
    }

    pub fn session(&self, database: DatabaseId) -> Option<&Arc<dyn DatabaseSession>> {
        self.sessions
            .iter()
            .find(|(id, _)| *id == database)
            .map(|(_, session)| session)
    }

    /// Joined sessions in join order.
    pub fn sessions(&self) -> &[(DatabaseId, Arc<dyn DatabaseSession>)] {
        &self.sessions
    }

    pub(crate) fn add_session(&mut self, database: DatabaseId, session: Arc<dyn DatabaseSession>) {
        self.sessions.push((database, session));
    }

    pub fn pending_events(&self) -> &[EntityChangeEvent] {
        &self.pending_events
    }

    pub(crate) fn push_event(&mut self, event: EntityChangeEvent) {
        self.pending_events.push(event);
    }

    pub(crate) fn into_parts(self) -> (Vec<(DatabaseId, Arc<dyn DatabaseSession>)>, Vec<EntityChangeEvent>, bool) {
        (self.sessions, self.pending_events, self.rollback)
    }
}

impl fmt::Debug for TransactionFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionFrame")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("rollback", &self.rollback)
            .field("depth", &self.depth)
            .field("sessions", &self.sessions.len())
            .field("pending_events", &self.pending_events.len())
            .finish()
    }
}
