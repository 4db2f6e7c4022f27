// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Propagating transactions over database sessions.
//
// Each logical call chain owns a stack of frames. A frame is either a real
// transaction or a pass-through scope; `begin_transaction_with` resolves the
// requested propagation attribute against the frame on top and either pushes
// a new frame or re-enters the top one. Sessions join a frame lazily, one per
// database, and are committed or rolled back and closed when the frame's
// depth drops to zero. Entity change events recorded meanwhile are broadcast
// only after that.
//
// ============================================================================

pub mod attribute;
pub mod event;
pub mod frame;
pub mod manager;

pub use attribute::{Propagation, TransactionAttribute};
pub use event::{
    ChannelEventBroadcaster, EntityChangeEvent, EntityChangeEventBroadcaster,
    EntityChangeEventType, LoggingEventBroadcaster, NoOpEventBroadcaster,
};
pub use frame::{FrameId, FrameKind, TransactionFrame};
pub use manager::DatabaseTransactionManager;
