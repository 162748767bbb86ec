use async_trait::async_trait;
use bson::Document;
use futures::StreamExt;

use crate::{
    backend::{DocumentCursor, FindRequest, StoreBackend},
    error::DocMapResult,
};

/// A backend holding no documents and accepting every write.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct NullBackend;

#[async_trait]
impl StoreBackend for NullBackend {
    async fn find(&self, _collection: &str, _request: FindRequest) -> DocMapResult<DocumentCursor> {
        Ok(futures::stream::empty().boxed())
    }

    async fn count(&self, _collection: &str, _filter: Document) -> DocMapResult<u64> {
        Ok(0)
    }

    async fn insert_or_replace(&self, _collection: &str, _document: Document) -> DocMapResult<()> {
        Ok(())
    }

    async fn remove(&self, _collection: &str, _filter: Document) -> DocMapResult<u64> {
        Ok(0)
    }

    async fn create_index(
        &self,
        _collection: &str,
        _keys: Document,
        _options: Document,
    ) -> DocMapResult<()> {
        Ok(())
    }

    async fn ensure_collection(&self, _name: &str, _options: Document) -> DocMapResult<()> {
        Ok(())
    }

    async fn list_collections(&self) -> DocMapResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn drop_collection(&self, _name: &str) -> DocMapResult<()> {
        Ok(())
    }
}
