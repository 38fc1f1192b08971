use crate::errors::DomainResult;
use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};

/// Trait for finding rows by their integer primary key
#[async_trait]
pub trait FindById<T> {
    /// Find an entity by ID
    async fn find_by_id(&self, id: i64) -> DomainResult<T>;
}

/// Same lookup, inside a caller-owned transaction
#[async_trait]
pub trait FindByIdWithTx<T> {
    async fn find_by_id_with_tx<'t>(
        &self,
        id: i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<T>;
}
