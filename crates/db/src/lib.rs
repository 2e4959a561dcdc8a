pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, ping, DbPool};
pub use repositories::{
    CommitReceipt, ConversationStore, InMemoryConversationStore, RepositoryError,
    SqlConversationStore,
};
