// qvisor Infrastructure - SQLite handle store
// Implements: HandleRepository

mod connection;
mod handle_repository;
mod migration;

pub use connection::create_pool;
pub use handle_repository::SqliteHandleRepository;
pub use migration::run_migrations;
