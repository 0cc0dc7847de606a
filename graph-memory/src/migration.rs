//! Database migration utilities
//!
//! Version 1 stores wrote JSON records with embeddings inline. Version 2
//! stores MessagePack records and keeps vectors under separate `vec:` keys.

use std::path::Path;

use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MemoryError, Result};
use crate::node::{Entity, Episode, Fact, Mention};

/// Database version stored in metadata
const DB_VERSION_KEY: &[u8] = b"_db_version";
pub(crate) const CURRENT_VERSION: u32 = 2;

/// Check if database needs migration and perform if needed
pub fn migrate_if_needed(db_path: impl AsRef<Path>) -> Result<()> {
    let path = db_path.as_ref();

    // Database not initialized yet
    if !path.join("CURRENT").exists() {
        tracing::debug!(
            "No existing database found at {}, skipping migration",
            path.display()
        );
        return Ok(());
    }

    let mut opts = Options::default();
    opts.create_if_missing(false);
    let db = DB::open(&opts, path)?;

    let version = read_version(&db)?.unwrap_or(1);
    tracing::info!("Database version: {} (current: {})", version, CURRENT_VERSION);

    if version > CURRENT_VERSION {
        return Err(MemoryError::store(format!(
            "database version {} is newer than supported version {}",
            version, CURRENT_VERSION
        )));
    }

    if version < CURRENT_VERSION {
        tracing::warn!(
            "Database needs migration from v{} to v{}",
            version,
            CURRENT_VERSION
        );
        match version {
            1 => migrate_v1_to_v2(&db)?,
            other => {
                return Err(MemoryError::store(format!(
                    "unknown database version: {}",
                    other
                )))
            }
        }
        db.put(DB_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
        db.flush()?;
        tracing::info!("Migration completed successfully");
    }

    Ok(())
}

/// Record the current version on a freshly created database
pub(crate) fn stamp_version(db: &DB) -> Result<()> {
    if read_version(db)?.is_none() {
        db.put(DB_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
    }
    Ok(())
}

fn read_version(db: &DB) -> Result<Option<u32>> {
    let Some(bytes) = db.get(DB_VERSION_KEY)? else {
        return Ok(None);
    };
    let raw: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| MemoryError::store("invalid version format"))?;
    Ok(Some(u32::from_le_bytes(raw)))
}

/// Re-encode one JSON record, moving its embedding under `vector_key`
fn reencode<T, F>(
    batch: &mut WriteBatch,
    key: &[u8],
    value: &[u8],
    vector_key: impl FnOnce(&T) -> String,
    take_vector: F,
) -> Result<()>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut T) -> Option<Vec<f32>>,
{
    let mut record: T = serde_json::from_slice(value)?;
    if let Some(vector) = take_vector(&mut record) {
        batch.put(vector_key(&record).as_bytes(), bincode::serialize(&vector)?);
    }
    batch.put(key, rmp_serde::to_vec_named(&record)?);
    Ok(())
}

fn migrate_v1_to_v2(db: &DB) -> Result<()> {
    tracing::info!("Migrating database from v1 to v2...");

    let mut batch = WriteBatch::default();
    let mut migrated = 0usize;

    for item in db.iterator(IteratorMode::Start) {
        let (key, value) = item?;
        let key_str = String::from_utf8_lossy(&key);

        let outcome = if key_str.starts_with("ep:") {
            reencode::<Episode, _>(
                &mut batch,
                &key,
                &value,
                |e| format!("vec:ep:{}", e.id),
                |e| e.embedding.take(),
            )
        } else if key_str.starts_with("ent:") {
            reencode::<Entity, _>(
                &mut batch,
                &key,
                &value,
                |e| format!("vec:ent:{}", e.id),
                |e| e.name_embedding.take(),
            )
        } else if key_str.starts_with("fact:") {
            reencode::<Fact, _>(
                &mut batch,
                &key,
                &value,
                |f| format!("vec:fact:{}", f.id),
                |f| f.embedding.take(),
            )
        } else if key_str.starts_with("men:") {
            reencode::<Mention, _>(&mut batch, &key, &value, |_| String::new(), |_| None)
        } else {
            continue;
        };

        match outcome {
            Ok(()) => migrated += 1,
            // Skip corrupted entries rather than fail entire migration
            Err(e) => tracing::error!("Failed to migrate {}: {}. Skipping.", key_str, e),
        }
    }

    tracing::info!("Migrated {} records", migrated);
    db.write(batch)?;
    Ok(())
}
