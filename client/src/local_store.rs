//! Content already materialised on this host, addressed by layer serial and
//! content digest.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use layerlift_delta::{Digest, Error, ImageRef, Layer};
use redb::{Database, ReadableTable, TableDefinition};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

const LAYER_TABLE: TableDefinition<u64, &str> = TableDefinition::new("layer");
const IMAGE_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("image");

const DB_NAME: &str = "local.redb";

#[derive(Clone)]
pub struct LocalStore {
    root: PathBuf,
    db: Arc<Database>,
}

impl LocalStore {
    /// Opens the store below `root`, creating its layout if needed.
    #[instrument(err)]
    pub async fn open(root: PathBuf) -> Result<Self, Error> {
        tokio::fs::create_dir_all(root.join("layers")).await?;
        tokio::fs::create_dir_all(root.join("traces")).await?;

        let empty = root.join("empty");
        if !tokio::fs::try_exists(&empty).await? {
            tokio::fs::write(&empty, b"").await?;
        }

        let db_path = root.join(DB_NAME);
        let db = tokio::task::spawn_blocking(|| -> Result<_, redb::Error> {
            let db = redb::Database::create(db_path)?;
            let txn = db.begin_write()?;
            txn.open_table(LAYER_TABLE)?;
            txn.open_table(IMAGE_TABLE)?;
            txn.commit()?;
            Ok(db)
        })
        .await??;

        Ok(Self {
            root,
            db: Arc::new(db),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layer_dir(&self, serial: u64) -> PathBuf {
        self.root.join("layers").join(serial.to_string())
    }

    pub fn content_path(&self, serial: u64, digest: &Digest) -> PathBuf {
        self.layer_dir(serial).join(digest.content_path())
    }

    /// Backs every empty regular file.
    pub fn empty_path(&self) -> PathBuf {
        self.root.join("empty")
    }

    pub fn traces_dir(&self) -> PathBuf {
        self.root.join("traces")
    }

    pub async fn has_content(&self, serial: u64, digest: &Digest) -> bool {
        tokio::fs::try_exists(self.content_path(serial, digest))
            .await
            .unwrap_or(false)
    }

    /// Stores file content after checking it against its digest. The file
    /// only appears under its final name once completely written.
    #[instrument(skip(self, data), fields(layer.serial = serial, content.digest = %digest), err)]
    pub async fn write_content(
        &self,
        serial: u64,
        digest: &Digest,
        data: &[u8],
    ) -> Result<PathBuf, Error> {
        let actual = Digest::of(data);
        if actual != *digest {
            return Err(Error::Protocol(format!(
                "content {} arrived with digest {}",
                digest, actual
            )));
        }

        let path = self.content_path(serial, digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = path.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &path).await?;

        debug!(size = data.len(), "materialised");
        Ok(path)
    }

    /// Makes content held under `from` available under `to` as well, by hard
    /// link where possible and by copy otherwise.
    #[instrument(skip(self), fields(content.digest = %digest), err)]
    pub async fn adopt_content(&self, from: u64, to: u64, digest: &Digest) -> Result<PathBuf, Error> {
        let path = self.content_path(to, digest);
        if from == to || self.has_content(to, digest).await {
            return Ok(path);
        }

        let held = self.content_path(from, digest);
        if !self.has_content(from, digest).await {
            return Err(Error::StorageError(format!(
                "content {} not held under serial {}",
                digest, from
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = path.with_extension("partial");
        if let Err(e) = tokio::fs::hard_link(&held, &partial).await {
            debug!(err=%e, "hard link failed, copying");
            tokio::fs::copy(&held, &partial).await?;
        }
        tokio::fs::rename(&partial, &path).await?;

        Ok(path)
    }

    /// Remembers which digest each serial stands for.
    #[instrument(skip_all, fields(layers = layers.len()), err)]
    pub async fn record_layers(&self, layers: &[Layer]) -> Result<(), Error> {
        let db = self.db.clone();
        let layers: Vec<(u64, String)> = layers
            .iter()
            .map(|l| (l.serial, l.digest.to_string()))
            .collect();

        tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(LAYER_TABLE)?;
                for (serial, digest) in layers.iter() {
                    table.insert(*serial, digest.as_str())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn layer_digest(&self, serial: u64) -> Result<Option<Digest>, Error> {
        let db = self.db.clone();
        let digest = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(LAYER_TABLE)?;
            Ok(table.get(serial)?.map(|v| v.value().to_string()))
        })
        .await??;

        digest.map(|d| d.parse().map_err(Error::from)).transpose()
    }

    /// Marks an image as completely received, so later pulls may use it as
    /// their base.
    #[instrument(skip(self, serials), fields(image = %image), err)]
    pub async fn record_image(&self, image: &ImageRef, serials: &[u64]) -> Result<(), Error> {
        let db = self.db.clone();
        let key = image.to_string();
        let value = serde_json::to_vec(serials)?;

        tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(IMAGE_TABLE)?;
                table.insert(key.as_str(), value)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    /// All completely received images.
    pub async fn images(&self) -> Result<Vec<ImageRef>, Error> {
        let db = self.db.clone();
        let keys = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(IMAGE_TABLE)?;
            let mut keys = vec![];
            for entry in table.iter()? {
                let (k, _) = entry?;
                keys.push(k.value().to_string());
            }
            Ok(keys)
        })
        .await??;

        keys.iter().map(|k| k.parse()).collect()
    }

    pub async fn image_serials(&self, image: &ImageRef) -> Result<Option<Vec<u64>>, Error> {
        let db = self.db.clone();
        let key = image.to_string();
        let value = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(IMAGE_TABLE)?;
            Ok(table.get(key.as_str())?.map(|v| v.value()))
        })
        .await??;

        match value {
            None => Ok(None),
            Some(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
        }
    }
}
