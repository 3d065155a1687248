pub mod conversation;
pub mod database;
pub mod events;
pub mod generation;
pub mod settings;
pub mod store;
pub mod streaming;
pub mod sync;
pub mod write_queue;

pub use database::{Database, PutOutcome};
pub use events::{ChangeNotifier, EventKind, StoreEvent};
pub use generation::{run_generation, GenerationEvent, GenerationParams};
pub use settings::{SettingsService, SyncSettings};
pub use store::LocalStore;
pub use streaming::{StreamingGuard, StreamingLease};
pub use sync::{SyncOutcome, SyncReconciler, SyncReport};
pub use write_queue::WriteQueue;
