//! # underwrite-db
//!
//! Record and blob storage for the extraction pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - [`PgDocumentStore`], the PostgreSQL record store
//! - [`MemoryDocumentStore`] with the same semantics, for tests and
//!   database-less runs
//! - Filesystem and in-memory blob stores
//!
//! ## Example
//!
//! ```rust,ignore
//! use underwrite_db::Database;
//!
//! let db = Database::connect("postgres://localhost/underwrite").await?;
//! db.migrate().await?;
//! let doc = db.documents.get_document(id).await?;
//! ```

pub mod blob;
pub mod documents;
pub mod memory;
pub mod pool;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

pub use underwrite_core::*;

pub use blob::{FilesystemBlobStore, MemoryBlobStore};
pub use documents::PgDocumentStore;
pub use memory::MemoryDocumentStore;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};

/// Combined database context.
#[derive(Clone)]
pub struct Database {
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub documents: PgDocumentStore,
}

impl Database {
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            documents: PgDocumentStore::new(pool.clone()),
            pool,
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
