pub mod conversation;
pub mod correspondent;
pub mod record;
pub mod schema;
