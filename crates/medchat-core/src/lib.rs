pub mod backend;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod models;
pub mod reconcile;
pub mod runtime;
pub mod store;
pub mod subscription;
pub mod tracing_setup;

pub use backend::{BackendError, FhirBackend, MedplumClient, MemoryBackend};
pub use config::CoreConfig;
pub use error::ChatError;
pub use events::{ChannelListener, ChatListener, CoreEvent};
pub use models::{Communication, Profile, Reference};
pub use runtime::ChatRuntime;
pub use store::{AvatarCache, ThreadStore};
pub use subscription::{ConnectionState, ConnectionStatus, SubscriptionCoordinator};
