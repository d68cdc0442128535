//! SQLite persistence and the tagged-string wire codec

pub mod codec;
mod database;

pub use codec::Record;
pub use database::Database;
