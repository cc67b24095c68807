// ABOUTME: PostgreSQL connectivity shared by the source reader and destination writer
// ABOUTME: Re-exports connection helpers

pub mod connection;

pub use connection::{connect, connect_with_retry, PgConnection, TlsPolicy};
