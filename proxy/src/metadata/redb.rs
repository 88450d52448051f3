use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use layerlift_delta::{
    optimizer::PriorityTable, toc::Toc, Collection, Digest, Error, ImageRef,
};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{instrument, warn};

use super::MetadataStore;
use crate::upstream::LayerDescriptor;

// All values are JSON documents, keyed by their natural string identity.
const MANIFEST_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("manifest");
const TOC_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("toc");
const SERIAL_TABLE: TableDefinition<&str, u64> = TableDefinition::new("serial");
const COLLECTION_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("collection");
const PRIORITY_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("priority");

#[derive(Clone)]
pub struct RedbMetadataStore {
    // Arc'd so it can be moved into spawn_blocking.
    db: Arc<Database>,
}

impl RedbMetadataStore {
    /// Opens (or creates) the database at the given path.
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        if path == PathBuf::from("/") {
            return Err(Error::StorageError(
                "cowardly refusing to open / with redb".to_string(),
            ));
        }

        let db = tokio::task::spawn_blocking(|| -> Result<_, redb::Error> {
            let db = redb::Database::create(path)?;
            create_schema(&db)?;
            Ok(db)
        })
        .await??;

        Ok(Self { db: Arc::new(db) })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;

        create_schema(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    async fn get_json(
        &self,
        table: TableDefinition<'static, &'static str, Vec<u8>>,
        key: String,
    ) -> Result<Option<Vec<u8>>, Error> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(table)?;
            Ok(table.get(key.as_str())?.map(|v| v.value()))
        })
        .await?
    }

    async fn put_json(
        &self,
        table: TableDefinition<'static, &'static str, Vec<u8>>,
        key: String,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(table)?;
                table.insert(key.as_str(), value)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }
}

/// Ensures all tables are present.
fn create_schema(db: &redb::Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(MANIFEST_TABLE)?;
    txn.open_table(TOC_TABLE)?;
    txn.open_table(SERIAL_TABLE)?;
    txn.open_table(COLLECTION_TABLE)?;
    txn.open_table(PRIORITY_TABLE)?;
    txn.commit()?;

    Ok(())
}

#[async_trait]
impl MetadataStore for RedbMetadataStore {
    #[instrument(skip(self), fields(image = %image), err)]
    async fn get_manifest(&self, image: &ImageRef) -> Result<Option<Vec<LayerDescriptor>>, Error> {
        match self.get_json(MANIFEST_TABLE, image.to_string()).await? {
            None => Ok(None),
            Some(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
        }
    }

    #[instrument(skip(self, layers), fields(image = %image), err)]
    async fn put_manifest(&self, image: &ImageRef, layers: &[LayerDescriptor]) -> Result<(), Error> {
        self.put_json(MANIFEST_TABLE, image.to_string(), serde_json::to_vec(layers)?)
            .await
    }

    #[instrument(skip(self), fields(layer.digest = %layer), err)]
    async fn get_toc(&self, layer: &Digest) -> Result<Option<Toc>, Error> {
        match self.get_json(TOC_TABLE, layer.to_string()).await? {
            None => Ok(None),
            Some(buf) => Ok(Some(serde_json::from_slice(&buf).map_err(|e| {
                warn!(err=%e, "failed to parse stored TOC");
                Error::StorageError("failed to parse stored TOC".to_string())
            })?)),
        }
    }

    #[instrument(skip(self, toc), fields(layer.digest = %layer), err)]
    async fn put_toc(&self, layer: &Digest, toc: &Toc) -> Result<(), Error> {
        self.put_json(TOC_TABLE, layer.to_string(), serde_json::to_vec(toc)?)
            .await
    }

    #[instrument(skip(self), fields(layer.digest = %layer), err)]
    async fn layer_serial(&self, layer: &Digest) -> Result<u64, Error> {
        let db = self.db.clone();
        let key = layer.to_string();
        tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_write()?;
            let serial = {
                let mut table = txn.open_table(SERIAL_TABLE)?;
                let existing = table.get(key.as_str())?.map(|v| v.value());
                match existing {
                    Some(serial) => serial,
                    None => {
                        let serial = table.len()? + 1;
                        table.insert(key.as_str(), serial)?;
                        serial
                    }
                }
            };
            txn.commit()?;
            Ok(serial)
        })
        .await?
    }

    #[instrument(skip(self), err)]
    async fn get_collection(&self, signature: &str) -> Result<Option<Collection>, Error> {
        match self
            .get_json(COLLECTION_TABLE, signature.to_string())
            .await?
        {
            None => Ok(None),
            Some(buf) => Ok(Some(Collection::from_json(&buf)?)),
        }
    }

    #[instrument(skip_all, fields(collection = %collection.signature()), err)]
    async fn put_collection(&self, collection: &Collection) -> Result<(), Error> {
        self.put_json(
            COLLECTION_TABLE,
            collection.signature(),
            collection.to_json()?,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn get_priorities(&self, signature: &str) -> Result<PriorityTable, Error> {
        match self.get_json(PRIORITY_TABLE, signature.to_string()).await? {
            None => Ok(PriorityTable::default()),
            Some(buf) => PriorityTable::from_json(&buf),
        }
    }

    #[instrument(skip(self, update), fields(update.len = update.len()), err)]
    async fn merge_priorities(&self, signature: &str, update: PriorityTable) -> Result<(), Error> {
        let db = self.db.clone();
        let key = signature.to_string();
        tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(PRIORITY_TABLE)?;
                let stored = table.get(key.as_str())?.map(|v| v.value());
                let mut priorities = match stored {
                    Some(buf) => PriorityTable::from_json(&buf)?,
                    None => PriorityTable::default(),
                };
                priorities.absorb(update);
                table.insert(key.as_str(), priorities.to_json()?)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }
}
