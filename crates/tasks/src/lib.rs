//! Durable task status records.
//!
//! Both stores implement [`pipeline::TaskStatusStore`]: create a record,
//! apply a partial update (refreshing `updated_at`), and look one up by id.
//! Updating an unknown task fails with
//! [`pipeline::InfrastructureError::TaskNotFound`].

mod memory;
mod postgres;

pub use memory::MemoryTaskStore;
pub use postgres::PostgresTaskStore;
