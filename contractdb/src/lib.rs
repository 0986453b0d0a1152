pub mod error;
pub mod contract;
pub mod schema;
pub mod select;
pub mod sql;
pub mod matcher;
pub mod validation;
pub mod patch;
pub mod permission;
pub mod view;
pub mod backend;
pub mod stream;
pub mod kernel;
pub mod cards;
pub mod config;

pub use error::{ContractDbError, Result};
pub use backend::{Backend, SqliteBackend};
pub use config::KernelConfig;
pub use contract::Contract;
pub use kernel::Kernel;
pub use patch::PatchOperation;
pub use schema::Schema;
pub use select::SelectMap;
pub use sql::{compile, QueryOptions, SortDir, SqlQuery, Tables};
pub use stream::{Stream, StreamEvent};

#[cfg(test)]
pub(crate) mod test_utils {
    use crate::{Kernel, KernelConfig, SqliteBackend};

    /// An initialized kernel over a fresh in-memory database.
    pub fn kernel() -> Kernel<SqliteBackend> {
        let kernel = Kernel::open(KernelConfig::default()).unwrap();
        kernel.initialize().unwrap();
        kernel
    }

    pub fn random_slug(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
    }

    pub fn random_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
