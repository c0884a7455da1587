//! Server-driven entity replication with per-client visibility, and
//! client-side prediction with rollback.

pub mod channel;
pub mod error;
pub mod prediction;
pub mod receiver;
pub mod registry;
pub mod replication;
pub mod visibility;

pub use channel::{
    ChannelConfig, ChannelDirection, ChannelId, ChannelMode, ChannelTable, InboundMessage,
    LoopbackTransport, OutboundMessage, Transport,
};
pub use error::{ParseSettingError, PredictionError, ReplicationError, TransportError};
pub use prediction::{
    ClientPredictionManager, ConfirmationOutcome, HistoryOverflow, PredictionConfig,
    PredictionFrame, PredictionRollback, PredictionStats, PredictionStatus, RollbackHandle,
    SnapshotOutcome,
};
pub use receiver::{AppliedBatch, ReplicationReceiver, ServerEntity};
pub use registry::{
    ComponentDescriptor, ComponentRegistry, ComponentTypeTag, ComponentValue, EntityState,
    Replicated, values_diverge,
};
pub use replication::{
    ChangeKind, ClientAck, ClientId, ClientReplicationStats, ReplicationBatch, ReplicationConfig,
    ReplicationItem, ReplicationManager, ReplicationStrategy, TickReport,
};
pub use visibility::{
    CacheStats, ClientVisibility, VisibilityChangeRecord, VisibilityChanges, VisibilityConfig,
    VisibilityPolicy,
};
