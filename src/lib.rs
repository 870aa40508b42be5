// Op Pipeline - client-side operation pipeline for collaborative documents

pub mod codec;
pub mod config;
pub mod duplicate_detector;
pub mod error;
pub mod handlers;
pub mod id_allocation;
pub mod message;
pub mod outbox;
pub mod pending;
pub mod persistence;
pub mod runtime;
pub mod scheduler;
pub mod staging;
pub mod transport;

pub use config::{CompressionOptions, PipelineConfig};
pub use error::{PipelineError, Result};
pub use handlers::{HandlerCategory, HandlerError, HandlerTable, MessageHandler, Submitter};
pub use id_allocation::{IdCompressor, IdCreationRange};
pub use message::wire::{SequencedWireMessage, WireMessage};
pub use message::{BatchId, LocalMessage, MessageMetadata, MessageType};
pub use pending::{PendingLocalState, ProcessedMessage};
pub use persistence::{FileStateStore, InMemoryStateStore, PersistedRuntimeState, StateStore};
pub use runtime::{CommitOptions, PipelineRuntime};
pub use scheduler::{FlushMode, ManualScheduler, Scheduler};
pub use transport::{Transport, TransportError};
