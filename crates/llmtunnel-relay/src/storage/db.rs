//! `SQLite` database for the llmtunnel relay.

pub use llmtunnel_core::db::DatabaseError;

llmtunnel_core::define_database!(RelayDatabase, "Relay database migrations complete");
