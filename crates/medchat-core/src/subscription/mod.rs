//! Live feed: one thread-root subscription per profile session.

pub mod coordinator;

pub use coordinator::SubscriptionCoordinator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Set by a socket close, cleared by the next `Connect`
    pub reconnecting: bool,
    /// Latched by the first `Connect` of the session
    pub connected_once: bool,
}
