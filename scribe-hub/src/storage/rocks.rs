//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: latest document snapshot per room (LZ4 compressed)
//! - `metadata`: per-room bookkeeping (bincode: write count, sizes, timestamps)
//!
//! Keys are the raw UTF-8 bytes of the room id. Snapshot and metadata are
//! written in one `WriteBatch`, so a failed write leaves the previous pair
//! intact.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

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
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
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

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    /// Number of successful writes
    pub writes: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl RoomMetadata {
    fn new(room_id: &str) -> Self {
        let now = now_secs();
        Self {
            room_id: room_id.to_string(),
            writes: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed snapshot store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            CF_SNAPSHOTS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Write a snapshot and its metadata atomically.
    pub fn save_snapshot(
        &self,
        room_id: &str,
        snapshot: &[u8],
    ) -> Result<RoomMetadata, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = match self.load_metadata(room_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => RoomMetadata::new(room_id),
            Err(e) => return Err(e),
        };
        meta.writes += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let key = room_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, key, &compressed);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Latest snapshot, LZ4 decompressed.
    pub fn load_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn load_metadata(&self, room_id: &str) -> Result<RoomMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(room_id.to_string())),
        }
    }

    pub fn room_exists(&self, room_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, room_id.as_bytes())?.is_some())
    }

    /// All room ids with a stored snapshot.
    pub fn room_ids(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for RocksStore {
    fn get(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.load_snapshot(room_id)
    }

    fn put(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.save_snapshot(room_id, snapshot).map(|_| ())
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        self.room_ids()
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let data = b"Hello, Scribe! A snapshot with enough text to be worth compressing.".to_vec();

        let meta = store.save_snapshot("R1", &data).unwrap();
        assert_eq!(meta.room_id, "R1");
        assert_eq!(meta.writes, 1);
        assert_eq!(meta.snapshot_size, data.len() as u64);

        assert_eq!(store.load_snapshot("R1").unwrap().unwrap(), data);
    }

    #[test]
    fn test_cold_room_is_none() {
        let (_dir, store) = open_temp();
        assert!(store.get("nowhere").unwrap().is_none());
        assert!(!store.room_exists("nowhere").unwrap());
        assert!(matches!(
            store.load_metadata("nowhere"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_put_overwrites_and_counts_writes() {
        let (_dir, store) = open_temp();
        store.put("R1", b"first").unwrap();
        store.put("R1", b"second").unwrap();

        assert_eq!(store.get("R1").unwrap().unwrap(), b"second");
        let meta = store.load_metadata("R1").unwrap();
        assert_eq!(meta.writes, 2);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_list_rooms() {
        let (_dir, store) = open_temp();
        for id in ["alpha", "beta", "gamma"] {
            store.put(id, id.as_bytes()).unwrap();
        }
        let mut rooms = store.list_rooms().unwrap();
        rooms.sort();
        assert_eq!(rooms, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_room_ids_with_shared_prefix_stay_isolated() {
        let (_dir, store) = open_temp();
        store.put("doc", b"short").unwrap();
        store.put("doc-2", b"longer").unwrap();
        assert_eq!(store.get("doc").unwrap().unwrap(), b"short");
        assert_eq!(store.get("doc-2").unwrap().unwrap(), b"longer");
    }

    #[test]
    fn test_reopen_keeps_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.put("R1", b"durable").unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(config).unwrap();
        assert_eq!(store.get("R1").unwrap().unwrap(), b"durable");
    }

    #[test]
    fn test_large_snapshot_compresses() {
        let (_dir, store) = open_temp();
        let data = vec![42u8; 1_000_000];
        let meta = store.save_snapshot("big", &data).unwrap();
        assert!(meta.compressed_size < 100_000);
        assert_eq!(store.get("big").unwrap().unwrap().len(), 1_000_000);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
