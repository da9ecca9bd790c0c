pub mod buffer;
pub mod config;
pub mod edit;
pub mod error;
pub mod save;
pub mod segment;
pub mod store;

pub use buffer::{Buffer, BufferEvent, BufferEventKind, BufferId, Permissions};
pub use config::{Config, KeepUndoPolicy};
pub use error::{BufferError, ConfigError, SaveError};
pub use save::{
    CancelToken, ProgressPhase, SaveAsStage, SaveCallbacks, SaveHandle, SaveKind, SaveOutcome,
    SaveStage, TempFileStage,
};
pub use store::{FixedProbe, SpaceProbe, SystemProbe};
