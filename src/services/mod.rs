//! Stateless business logic between the HTTP routes / workers and the stores.
//!
//! Every function takes its collaborators (stores, queue, config) as
//! arguments; nothing here holds state between calls.

pub mod aggregation;
pub mod health;
pub mod ingestion;
pub mod retention;
