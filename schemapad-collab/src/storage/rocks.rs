//! RocksDB-backed schema store.
//!
//! Column families:
//! - `schemas`   : id → bincode row, snapshot LZ4 compressed
//! - `edit_index`: edit hash → id
//!
//! Both are written in one batch so a row is never reachable by id
//! without its credential, or the other way round.

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{
    parse_credential, DocumentStore, NewSchema, SchemaPatch, SchemaRecord, StoreError,
    StoredSchema,
};

const CF_SCHEMAS: &str = "schemas";
const CF_EDIT_INDEX: &str = "edit_index";

const COLUMN_FAMILIES: &[&str] = &[CF_SCHEMAS, CF_EDIT_INDEX];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("schemapad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-chosen directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("schema store opened at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Snapshots are compressed before they get here.
            CF_SCHEMAS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of stored schemas.
    pub fn len(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_SCHEMAS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn load_row(&self, id: &str) -> Result<Option<StoredSchema>, StoreError> {
        let cf = self.cf(CF_SCHEMAS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => decode_row(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn id_for_credential(&self, credential: &str) -> Result<Option<String>, StoreError> {
        let Some(hash) = parse_credential(credential) else {
            return Ok(None);
        };
        let cf = self.cf(CF_EDIT_INDEX)?;
        match self.db.get_cf(&cf, hash.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

impl DocumentStore for RocksStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<SchemaRecord>, StoreError> {
        Ok(self.load_row(id)?.as_ref().map(StoredSchema::read_only))
    }

    async fn find_by_credential(
        &self,
        credential: &str,
    ) -> Result<Option<SchemaRecord>, StoreError> {
        let Some(id) = self.id_for_credential(credential)? else {
            return Ok(None);
        };
        Ok(self.load_row(&id)?.as_ref().map(StoredSchema::editable))
    }

    async fn create(&self, id: &str, schema: NewSchema) -> Result<SchemaRecord, StoreError> {
        if self.load_row(id)?.is_some() {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let row = StoredSchema::new(id, schema);

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SCHEMAS)?, id.as_bytes(), encode_row(&row)?);
        batch.put_cf(self.cf(CF_EDIT_INDEX)?, row.edit_hash.as_bytes(), id.as_bytes());
        self.write(batch)?;

        log::debug!("created schema {id}");
        Ok(row.editable())
    }

    async fn update(&self, credential: &str, patch: SchemaPatch) -> Result<bool, StoreError> {
        let Some(id) = self.id_for_credential(credential)? else {
            return Ok(false);
        };
        let Some(mut row) = self.load_row(&id)? else {
            log::warn!("edit index points at missing schema {id}");
            return Ok(false);
        };
        row.apply(patch);

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SCHEMAS)?, id.as_bytes(), encode_row(&row)?);
        self.write(batch)?;
        Ok(true)
    }
}

fn encode_row(row: &StoredSchema) -> Result<Vec<u8>, StoreError> {
    let packed = StoredSchema {
        snapshot: lz4_flex::compress_prepend_size(&row.snapshot),
        ..row.clone()
    };
    bincode::serde::encode_to_vec(&packed, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_row(bytes: &[u8]) -> Result<StoredSchema, StoreError> {
    let (mut row, _): (StoredSchema, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    row.snapshot = lz4_flex::decompress_size_prepended(&row.snapshot)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    Ok(row)
}
