//! Mock implementations for testing.

mod connection;
pub use connection::{Connection, Step};
mod filter;
pub use filter::{Collector, Received};
mod reader;
pub use reader::Reader;
