//! Mock connection implementations for testing.
//!
//! This module provides `MockConnection` and pre-built scenarios for testing
//! acquisition, reduction and polling without a running PostgreSQL server.

mod connection;
mod scenarios;

pub use connection::{MockConnection, MockCursor, MockResponse, MockRow};
