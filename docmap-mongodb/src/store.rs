use async_trait::async_trait;
use bson::{Bson, Document, de::deserialize_from_bson, doc};
use futures::{StreamExt, TryStreamExt};
use mongodb::{
    Client, Collection as MongoCollection, IndexModel,
    options::{ClientOptions, FindOptions, IndexOptions},
};

use docmap_core::{
    backend::{DocumentCursor, FindRequest, StoreBackend, StoreBackendBuilder},
    error::{DocMapError, DocMapResult},
    metadata::ID_KEY,
};

fn backend_error(err: mongodb::error::Error) -> DocMapError {
    DocMapError::Backend(err.to_string())
}

#[derive(Debug)]
pub struct MongoDbStore {
    client: Client,
    database: String,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client
            .database(&self.database)
            .collection(collection_name)
    }

    async fn shutdown(self) -> DocMapResult<()> {
        self.client.shutdown().await;

        Ok(())
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn find(&self, collection: &str, request: FindRequest) -> DocMapResult<DocumentCursor> {
        let mut options = FindOptions::default();

        options.projection = request.projection;
        options.sort = request.sort;
        if request.skip > 0 {
            options.skip = Some(request.skip);
        }
        if let Some(limit) = request.limit {
            options.limit = Some(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        log::trace!("find in {collection}: {}", request.filter);

        Ok(self
            .get_collection(collection)
            .find(request.filter)
            .with_options(options)
            .await
            .map_err(backend_error)?
            .map_err(backend_error)
            .boxed())
    }

    async fn count(&self, collection: &str, filter: Document) -> DocMapResult<u64> {
        self.get_collection(collection)
            .count_documents(filter)
            .await
            .map_err(backend_error)
    }

    async fn insert_or_replace(&self, collection: &str, document: Document) -> DocMapResult<()> {
        let id = document.get(ID_KEY).cloned().ok_or_else(|| {
            DocMapError::InvalidDocument(format!(
                "documents stored in {collection} must carry an {ID_KEY}"
            ))
        })?;

        self.get_collection(collection)
            .replace_one(doc! { ID_KEY: id }, document)
            .upsert(true)
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    async fn remove(&self, collection: &str, filter: Document) -> DocMapResult<u64> {
        Ok(self
            .get_collection(collection)
            .delete_many(filter)
            .await
            .map_err(backend_error)?
            .deleted_count)
    }

    async fn create_index(
        &self,
        collection: &str,
        keys: Document,
        options: Document,
    ) -> DocMapResult<()> {
        let options: IndexOptions = deserialize_from_bson(Bson::Document(options))
            .map_err(|e| DocMapError::InvalidDocument(e.to_string()))?;

        self.get_collection(collection)
            .create_index(IndexModel::builder().keys(keys).options(options).build())
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    async fn ensure_collection(&self, name: &str, options: Document) -> DocMapResult<()> {
        let database = self.client.database(&self.database);

        let existing = database
            .list_collection_names()
            .await
            .map_err(backend_error)?;
        if existing.iter().any(|existing| existing == name) {
            return Ok(());
        }

        let mut create = database.create_collection(name);
        if options.get_bool("capped").unwrap_or(false) {
            create = create.capped(true);
            if let Some(size) = integer_option(&options, "size") {
                create = create.size(size);
            }
            if let Some(max) = integer_option(&options, "max") {
                create = create.max(max);
            }
        }

        create.await.map_err(backend_error)?;

        Ok(())
    }

    async fn list_collections(&self) -> DocMapResult<Vec<String>> {
        self.client
            .database(&self.database)
            .list_collection_names()
            .await
            .map_err(backend_error)
    }

    async fn drop_collection(&self, name: &str) -> DocMapResult<()> {
        self.get_collection(name)
            .drop()
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    async fn shutdown(self) -> DocMapResult<()> {
        self.shutdown().await
    }
}

fn integer_option(options: &Document, key: &str) -> Option<u64> {
    match options.get(key) {
        Some(Bson::Int32(value)) => u64::try_from(*value).ok(),
        Some(Bson::Int64(value)) => u64::try_from(*value).ok(),
        _ => None,
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> DocMapResult<Self::Backend> {
        Ok(MongoDbStore::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(|e| DocMapError::Initialization(e.to_string()))?,
            )
            .map_err(|e| DocMapError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}
