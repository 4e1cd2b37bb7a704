//! Storage contract and its SQLite and in-memory backends
//!
//! Blocks, epoch blocks and accounts are stored in their canonical encoding.
//! `commit_block` writes a block, the accounts it touched, and the new chain
//! tip in a single transaction.

use crate::crypto::Address;
use crate::error::{ChainError, Result};
use crate::protocol::{Account, Block, Codec, EpochBlock, Genesis, Hash};
use lru::LruCache;
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

const BLOCK_CACHE_SIZE: usize = 256;

/// Read/write contract the validator core needs from a persistence engine.
pub trait Store: Send + Sync {
    fn read_closed_block(&self, hash: &Hash) -> Result<Option<Block>>;
    fn write_closed_block(&self, block: &Block) -> Result<()>;
    fn read_closed_epoch_block(&self, hash: &Hash) -> Result<Option<EpochBlock>>;
    fn write_closed_epoch_block(&self, block: &EpochBlock) -> Result<()>;
    /// The epoch block with the greatest height.
    fn read_last_epoch_block(&self) -> Result<Option<EpochBlock>>;
    fn read_account(&self, address: &Address) -> Result<Option<Account>>;
    fn write_accounts(&self, accounts: &[Account]) -> Result<()>;
    fn load_state(&self) -> Result<BTreeMap<Address, Account>>;
    fn read_genesis(&self) -> Result<Option<Genesis>>;
    fn write_genesis(&self, genesis: &Genesis) -> Result<()>;
    /// Hash of the head of this node's own shard chain.
    fn read_chain_tip(&self) -> Result<Option<Hash>>;
    fn write_chain_tip(&self, hash: &Hash) -> Result<()>;
    /// Persists a block, the accounts it changed and the new tip atomically.
    fn commit_block(&self, block: &Block, accounts: &[Account], tip: &Hash) -> Result<()>;
    /// Persists the accounts a sibling shard's transition changed together
    /// with that shard's applied height.
    fn commit_transition(&self, accounts: &[Account], shard_id: u32, height: u32) -> Result<()>;
    /// Applied transition height of every sibling shard.
    fn read_applied_transitions(&self) -> Result<BTreeMap<u32, u32>>;

    fn contains_block(&self, hash: &Hash) -> Result<bool> {
        Ok(self.read_closed_block(hash)?.is_some()
            || self.read_closed_epoch_block(hash)?.is_some())
    }
}

fn poisoned() -> ChainError {
    ChainError::Store("Mutex poisoned".to_string())
}

fn to_hash(bytes: Vec<u8>) -> Result<Hash> {
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ChainError::Store(format!("Stored hash has {} bytes", b.len())))
}

pub struct Database {
    conn: Mutex<Connection>,
    block_cache: Mutex<LruCache<Hash, Block>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::Store(format!("Failed to open database {}: {}", path, e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                hash BLOB PRIMARY KEY,
                height INTEGER NOT NULL,
                shard_id INTEGER NOT NULL,
                data BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS epoch_blocks (
                hash BLOB PRIMARY KEY,
                height INTEGER NOT NULL,
                data BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS epoch_blocks_height ON epoch_blocks (height);
            CREATE TABLE IF NOT EXISTS accounts (
                address BLOB PRIMARY KEY,
                data BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS applied_transitions (
                shard_id INTEGER PRIMARY KEY,
                height INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )
        .map_err(|e| ChainError::Store(format!("Failed to create tables: {}", e)))?;

        let capacity = NonZeroUsize::new(BLOCK_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Ok(Database {
            conn: Mutex::new(conn),
            block_cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| poisoned())
    }

    fn cache_block(&self, block: &Block) -> Result<()> {
        self.block_cache
            .lock()
            .map_err(|_| poisoned())?
            .put(block.hash, block.clone());
        Ok(())
    }

    fn read_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

impl Store for Database {
    fn read_closed_block(&self, hash: &Hash) -> Result<Option<Block>> {
        if let Some(block) = self.block_cache.lock().map_err(|_| poisoned())?.get(hash) {
            return Ok(Some(block.clone()));
        }
        let data = self
            .conn()?
            .query_row(
                "SELECT data FROM blocks WHERE hash = ?1",
                params![hash.to_vec()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        match data {
            Some(bytes) => {
                let block = Block::decode(&bytes)?;
                self.cache_block(&block)?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    fn write_closed_block(&self, block: &Block) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO blocks (hash, height, shard_id, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                block.hash.to_vec(),
                block.height as i64,
                block.shard_id as i64,
                block.encode()?
            ],
        )?;
        self.cache_block(block)
    }

    fn read_closed_epoch_block(&self, hash: &Hash) -> Result<Option<EpochBlock>> {
        let data = self
            .conn()?
            .query_row(
                "SELECT data FROM epoch_blocks WHERE hash = ?1",
                params![hash.to_vec()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        data.map(|bytes| EpochBlock::decode(&bytes)).transpose()
    }

    fn write_closed_epoch_block(&self, block: &EpochBlock) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO epoch_blocks (hash, height, data) VALUES (?1, ?2, ?3)",
            params![block.hash.to_vec(), block.height as i64, block.encode()?],
        )?;
        Ok(())
    }

    fn read_last_epoch_block(&self) -> Result<Option<EpochBlock>> {
        let data = self
            .conn()?
            .query_row(
                "SELECT data FROM epoch_blocks ORDER BY height DESC LIMIT 1",
                [],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        data.map(|bytes| EpochBlock::decode(&bytes)).transpose()
    }

    fn read_account(&self, address: &Address) -> Result<Option<Account>> {
        let data = self
            .conn()?
            .query_row(
                "SELECT data FROM accounts WHERE address = ?1",
                params![address.to_vec()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        data.map(|bytes| Account::decode(&bytes)).transpose()
    }

    fn write_accounts(&self, accounts: &[Account]) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        for account in accounts {
            tx.execute(
                "INSERT OR REPLACE INTO accounts (address, data) VALUES (?1, ?2)",
                params![account.address.to_vec(), account.encode()?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_state(&self) -> Result<BTreeMap<Address, Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT data FROM accounts")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut state = BTreeMap::new();
        for row in rows {
            let account = Account::decode(&row?)?;
            state.insert(account.address, account);
        }
        Ok(state)
    }

    fn read_genesis(&self) -> Result<Option<Genesis>> {
        self.read_metadata("genesis")?
            .map(|bytes| Genesis::decode(&bytes))
            .transpose()
    }

    fn write_genesis(&self, genesis: &Genesis) -> Result<()> {
        self.write_metadata("genesis", &genesis.encode()?)
    }

    fn read_chain_tip(&self) -> Result<Option<Hash>> {
        self.read_metadata("chain_tip")?.map(to_hash).transpose()
    }

    fn write_chain_tip(&self, hash: &Hash) -> Result<()> {
        self.write_metadata("chain_tip", hash)
    }

    fn commit_block(&self, block: &Block, accounts: &[Account], tip: &Hash) -> Result<()> {
        {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO blocks (hash, height, shard_id, data) VALUES (?1, ?2, ?3, ?4)",
                params![
                    block.hash.to_vec(),
                    block.height as i64,
                    block.shard_id as i64,
                    block.encode()?
                ],
            )?;
            for account in accounts {
                tx.execute(
                    "INSERT OR REPLACE INTO accounts (address, data) VALUES (?1, ?2)",
                    params![account.address.to_vec(), account.encode()?],
                )?;
            }
            tx.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES ('chain_tip', ?1)",
                params![tip.to_vec()],
            )?;
            tx.commit()?;
        }
        self.cache_block(block)
    }

    fn commit_transition(&self, accounts: &[Account], shard_id: u32, height: u32) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        for account in accounts {
            tx.execute(
                "INSERT OR REPLACE INTO accounts (address, data) VALUES (?1, ?2)",
                params![account.address.to_vec(), account.encode()?],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO applied_transitions (shard_id, height) VALUES (?1, ?2)",
            params![shard_id as i64, height as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn read_applied_transitions(&self) -> Result<BTreeMap<u32, u32>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT shard_id, height FROM applied_transitions")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;

        let mut applied = BTreeMap::new();
        for row in rows {
            let (shard_id, height) = row?;
            let shard_id = u32::try_from(shard_id)
                .map_err(|_| ChainError::Store(format!("Stored shard id {} out of range", shard_id)))?;
            let height = u32::try_from(height)
                .map_err(|_| ChainError::Store(format!("Stored height {} out of range", height)))?;
            applied.insert(shard_id, height);
        }
        Ok(applied)
    }
}

#[derive(Default)]
struct MemoryInner {
    blocks: HashMap<Hash, Block>,
    epoch_blocks: HashMap<Hash, EpochBlock>,
    accounts: BTreeMap<Address, Account>,
    genesis: Option<Genesis>,
    tip: Option<Hash>,
    applied: BTreeMap<u32, u32>,
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<MemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }
}

impl Store for InMemoryStore {
    fn read_closed_block(&self, hash: &Hash) -> Result<Option<Block>> {
        Ok(self.inner.read().blocks.get(hash).cloned())
    }

    fn write_closed_block(&self, block: &Block) -> Result<()> {
        self.inner.write().blocks.insert(block.hash, block.clone());
        Ok(())
    }

    fn read_closed_epoch_block(&self, hash: &Hash) -> Result<Option<EpochBlock>> {
        Ok(self.inner.read().epoch_blocks.get(hash).cloned())
    }

    fn write_closed_epoch_block(&self, block: &EpochBlock) -> Result<()> {
        self.inner
            .write()
            .epoch_blocks
            .insert(block.hash, block.clone());
        Ok(())
    }

    fn read_last_epoch_block(&self) -> Result<Option<EpochBlock>> {
        Ok(self
            .inner
            .read()
            .epoch_blocks
            .values()
            .max_by_key(|b| b.height)
            .cloned())
    }

    fn read_account(&self, address: &Address) -> Result<Option<Account>> {
        Ok(self.inner.read().accounts.get(address).cloned())
    }

    fn write_accounts(&self, accounts: &[Account]) -> Result<()> {
        let mut inner = self.inner.write();
        for account in accounts {
            inner.accounts.insert(account.address, account.clone());
        }
        Ok(())
    }

    fn load_state(&self) -> Result<BTreeMap<Address, Account>> {
        Ok(self.inner.read().accounts.clone())
    }

    fn read_genesis(&self) -> Result<Option<Genesis>> {
        Ok(self.inner.read().genesis.clone())
    }

    fn write_genesis(&self, genesis: &Genesis) -> Result<()> {
        self.inner.write().genesis = Some(genesis.clone());
        Ok(())
    }

    fn read_chain_tip(&self) -> Result<Option<Hash>> {
        Ok(self.inner.read().tip)
    }

    fn write_chain_tip(&self, hash: &Hash) -> Result<()> {
        self.inner.write().tip = Some(*hash);
        Ok(())
    }

    fn commit_block(&self, block: &Block, accounts: &[Account], tip: &Hash) -> Result<()> {
        let mut inner = self.inner.write();
        inner.blocks.insert(block.hash, block.clone());
        for account in accounts {
            inner.accounts.insert(account.address, account.clone());
        }
        inner.tip = Some(*tip);
        Ok(())
    }

    fn commit_transition(&self, accounts: &[Account], shard_id: u32, height: u32) -> Result<()> {
        let mut inner = self.inner.write();
        for account in accounts {
            inner.accounts.insert(account.address, account.clone());
        }
        inner.applied.insert(shard_id, height);
        Ok(())
    }

    fn read_applied_transitions(&self) -> Result<BTreeMap<u32, u32>> {
        Ok(self.inner.read().applied.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(height: u32) -> Block {
        let mut block = Block::new([height as u8; 32], height, 1, [9u8; 32]);
        block.seal(1_000 + height as i64, [1u8; 64]);
        block
    }

    #[test]
    fn test_database_open() {
        let db = Database::open(":memory:").unwrap();
        assert!(db.conn.lock().unwrap().is_autocommit());
        assert!(db.read_genesis().unwrap().is_none());
        assert!(db.read_chain_tip().unwrap().is_none());
    }

    #[test]
    fn test_commit_block_is_atomic_unit() {
        let db = Database::open(":memory:").unwrap();
        let block = sample_block(3);
        let account = Account::new([9u8; 32], [0u8; 32], 50);
        db.commit_block(&block, &[account.clone()], &block.hash).unwrap();

        assert_eq!(db.read_closed_block(&block.hash).unwrap(), Some(block.clone()));
        assert_eq!(db.read_account(&account.address).unwrap(), Some(account));
        assert_eq!(db.read_chain_tip().unwrap(), Some(block.hash));
        assert!(db.contains_block(&block.hash).unwrap());
    }

    #[test]
    fn test_last_epoch_block_by_height() {
        let db = Database::open(":memory:").unwrap();
        db.write_closed_epoch_block(&EpochBlock::new(vec![[1u8; 32]], 200)).unwrap();
        db.write_closed_epoch_block(&EpochBlock::new(vec![[2u8; 32]], 100)).unwrap();
        assert_eq!(db.read_last_epoch_block().unwrap().unwrap().height, 200);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");
        let path = path.to_str().unwrap();
        let genesis = Genesis::new([1u8; 32], [2u8; 32]);
        let block = sample_block(1);
        {
            let db = Database::open(path).unwrap();
            db.write_genesis(&genesis).unwrap();
            db.commit_block(&block, &[Account::new([3u8; 32], [1u8; 32], 7)], &block.hash)
                .unwrap();
        }
        let db = Database::open(path).unwrap();
        assert_eq!(db.read_genesis().unwrap(), Some(genesis));
        assert_eq!(db.read_closed_block(&block.hash).unwrap(), Some(block));
        assert_eq!(db.load_state().unwrap().len(), 1);
    }

    #[test]
    fn test_applied_transitions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");
        let path = path.to_str().unwrap();
        let account = Account::new([5u8; 32], [1u8; 32], 12);
        {
            let db = Database::open(path).unwrap();
            db.commit_transition(&[account.clone()], 2, 6).unwrap();
            db.commit_transition(&[], 2, 9).unwrap();
            db.commit_transition(&[], 3, 4).unwrap();
        }
        let db = Database::open(path).unwrap();
        let applied = db.read_applied_transitions().unwrap();
        assert_eq!(applied.get(&2), Some(&9));
        assert_eq!(applied.get(&3), Some(&4));
        assert_eq!(db.read_account(&account.address).unwrap(), Some(account));
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryStore::new();
        let block = sample_block(2);
        store
            .commit_block(&block, &[Account::new([4u8; 32], [0u8; 32], 1)], &block.hash)
            .unwrap();
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.read_chain_tip().unwrap(), Some(block.hash));
        assert_eq!(store.load_state().unwrap().len(), 1);
        assert!(store.read_last_epoch_block().unwrap().is_none());
    }
}
