pub mod blob;
pub mod entities;
pub mod registry;
mod seaorm;
mod storage;

pub use blob::{BlobError, BlobResult, BlobStore, MemoryBlobStore, SqlBlobStore};
pub use registry::{canonical_id, ProviderRegistry};
pub use seaorm::SeaOrmStorage;
pub use storage::{
    AuditDelta, AuditRow, CounterBatch, GatewayConfigRow, GlobalDelta, ProviderOutcomeSums,
    ProviderRecord, Storage, StorageError, StorageResult, UsageDelta,
};
