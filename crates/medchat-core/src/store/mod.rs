pub mod avatar_cache;
pub mod thread_store;
pub mod views;

pub use avatar_cache::AvatarCache;
pub use thread_store::{SessionPhase, StoreSnapshot, ThreadStore};
pub use views::{ChatMessage, SenderType, ThreadView};
