pub mod adapter;
pub mod migrations;
pub mod postgres;
mod url;

pub use adapter::{pg_type, sanitize_identifier, ColumnInfo, TsdbAdapter, TsdbError, TsdbRow};
pub use migrations::{run_migrations, MigrationError};
pub use postgres::{ConnectionPool, PostgresAdapter};
pub use url::postgres_url_from_environment;

pub use diesel::{Connection, PgConnection};
