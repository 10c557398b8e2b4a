use groat_core::{
    genesis_block, Block, BlockchainError, ChainParams, HashHex, HeaderView, Transaction,
    MAX_HASH_RANGE,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

const TIP_KEY: &[u8] = b"meta:tip";
const MAIN_BRANCH_KEY: &[u8] = b"meta:main_branch";
const BRANCH_SEQ_KEY: &[u8] = b"meta:branch_seq";

/// Result of offering a block to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Block persisted. `confirmed` lists transactions that joined the main
    /// chain (drop them from the mempool); `reinstated` lists transactions
    /// that left it in a reorg and are not in `confirmed` (re-admit them).
    Applied {
        confirmed: Vec<Transaction>,
        reinstated: Vec<Transaction>,
    },
    /// Parent unknown; the caller may retry after synchronizing.
    Orphan,
    Rejected(BlockchainError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredBlock {
    branch: u64,
    block: Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BranchHead {
    head: HashHex,
    height: u64,
}

/// Persistent block and transaction index over an embedded KV tree.
///
/// Key layout: `block:<hash>` holds the full block and its branch id,
/// `height:<n>` maps main-chain heights to hashes, `tx:<hash>` maps confirmed
/// main-chain transactions to their block, `branch:<id>` tracks each branch
/// head, and `meta:*` holds the tip pointer and counters. A reorg rewrites
/// the affected `height:*` and `tx:*` entries in a single write transaction,
/// so readers observe either the old or the new main chain.
pub struct ChainStore {
    db: sled::Db,
    params: ChainParams,
    write_lock: Mutex<()>,
}

fn store_err(err: impl std::fmt::Display) -> BlockchainError {
    BlockchainError::Store(err.to_string())
}

fn block_key(hash: &str) -> Vec<u8> {
    [b"block:" as &[u8], hash.as_bytes()].concat()
}

fn height_key(height: u64) -> Vec<u8> {
    [b"height:" as &[u8], &height.to_be_bytes()].concat()
}

fn tx_key(tx_hash: &str) -> Vec<u8> {
    [b"tx:" as &[u8], tx_hash.as_bytes()].concat()
}

fn branch_key(branch: u64) -> Vec<u8> {
    [b"branch:" as &[u8], &branch.to_be_bytes()].concat()
}

/// Pending writes applied atomically: `Some` inserts, `None` removes.
type WriteSet = Vec<(Vec<u8>, Option<Vec<u8>>)>;

impl ChainStore {
    pub fn open(path: &Path, params: ChainParams) -> Result<Self, BlockchainError> {
        let db = sled::open(path).map_err(store_err)?;
        Self::bootstrap(db, params)
    }

    /// In-memory store backed by a temporary sled database. Used by tests.
    pub fn open_temporary(params: ChainParams) -> Result<Self, BlockchainError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(store_err)?;
        Self::bootstrap(db, params)
    }

    fn bootstrap(db: sled::Db, params: ChainParams) -> Result<Self, BlockchainError> {
        let store = Self {
            db,
            params,
            write_lock: Mutex::new(()),
        };
        if store.db.get(TIP_KEY).map_err(store_err)?.is_none() {
            let genesis = genesis_block();
            let hash = genesis.header.hash();
            let mut writes: WriteSet = Vec::new();
            let record = StoredBlock {
                branch: 0,
                block: genesis.clone(),
            };
            writes.push((block_key(&hash), Some(encode(&record)?)));
            writes.push((height_key(0), Some(hash.as_bytes().to_vec())));
            for tx in &genesis.transactions {
                writes.push((tx_key(&tx.tx_hash), Some(hash.as_bytes().to_vec())));
            }
            writes.push((
                branch_key(0),
                Some(encode(&BranchHead {
                    head: hash.clone(),
                    height: 0,
                })?),
            ));
            writes.push((TIP_KEY.to_vec(), Some(hash.as_bytes().to_vec())));
            writes.push((MAIN_BRANCH_KEY.to_vec(), Some(0u64.to_be_bytes().to_vec())));
            writes.push((BRANCH_SEQ_KEY.to_vec(), Some(1u64.to_be_bytes().to_vec())));
            store.commit(writes)?;
            info!(genesis = %hash, "initialized chain store at genesis");
        }
        Ok(store)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    fn commit(&self, writes: WriteSet) -> Result<(), BlockchainError> {
        self.db
            .transaction(|tree| {
                for (key, value) in &writes {
                    match value {
                        Some(bytes) => {
                            tree.insert(key.as_slice(), bytes.as_slice())?;
                        }
                        None => {
                            tree.remove(key.as_slice())?;
                        }
                    }
                }
                Ok(())
            })
            .map_err(|err: TransactionError<()>| match err {
                TransactionError::Abort(()) => BlockchainError::Store("transaction aborted".into()),
                TransactionError::Storage(e) => store_err(e),
            })?;
        self.db.flush().map_err(store_err)?;
        Ok(())
    }

    fn record(&self, hash: &str) -> Result<Option<StoredBlock>, BlockchainError> {
        match self.db.get(block_key(hash)).map_err(store_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn branch_head(&self, branch: u64) -> Result<Option<BranchHead>, BlockchainError> {
        match self.db.get(branch_key(branch)).map_err(store_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn meta_u64(&self, key: &[u8]) -> Result<u64, BlockchainError> {
        let bytes = self
            .db
            .get(key)
            .map_err(store_err)?
            .ok_or_else(|| BlockchainError::Store("missing store metadata".into()))?;
        let arr: [u8; 8] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| BlockchainError::Store("corrupt store metadata".into()))?;
        Ok(u64::from_be_bytes(arr))
    }

    fn main_hash_at(&self, height: u64) -> Result<Option<HashHex>, BlockchainError> {
        match self.db.get(height_key(height)).map_err(store_err)? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes.to_vec()).map_err(store_err)?,
            )),
            None => Ok(None),
        }
    }

    fn on_main_chain(&self, height: u64, hash: &str) -> Result<bool, BlockchainError> {
        Ok(self.main_hash_at(height)?.as_deref() == Some(hash))
    }

    /// Head of the main chain.
    pub fn tip(&self) -> Result<HeaderView, BlockchainError> {
        let bytes = self
            .db
            .get(TIP_KEY)
            .map_err(store_err)?
            .ok_or_else(|| BlockchainError::Store("missing tip pointer".into()))?;
        let hash = String::from_utf8(bytes.to_vec()).map_err(store_err)?;
        self.get_header_by_hash(&hash)?
            .ok_or_else(|| BlockchainError::Store("dangling tip pointer".into()))
    }

    pub fn height(&self) -> Result<u64, BlockchainError> {
        Ok(self.tip()?.height)
    }

    pub fn get_header_by_hash(&self, hash: &str) -> Result<Option<HeaderView>, BlockchainError> {
        Ok(self.record(hash)?.map(|record| HeaderView {
            hash: hash.to_string(),
            height: record.block.height,
            branch: record.branch,
            header: record.block.header,
        }))
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, BlockchainError> {
        Ok(self.record(hash)?.map(|record| record.block))
    }

    /// Main chain only.
    pub fn get_header_by_height(&self, height: u64) -> Result<Option<HeaderView>, BlockchainError> {
        match self.main_hash_at(height)? {
            Some(hash) => self.get_header_by_hash(&hash),
            None => Ok(None),
        }
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, BlockchainError> {
        match self.main_hash_at(height)? {
            Some(hash) => self.get_block_by_hash(&hash),
            None => Ok(None),
        }
    }

    /// Main-chain block hashes for heights `start..=end`; the span is capped
    /// at `MAX_HASH_RANGE` and truncated at the tip.
    pub fn get_hashes_range(&self, start: u64, end: u64) -> Result<Vec<HashHex>, BlockchainError> {
        if end < start {
            return Ok(Vec::new());
        }
        let end = end.min(start.saturating_add(MAX_HASH_RANGE));
        let mut hashes = Vec::new();
        for height in start..=end {
            match self.main_hash_at(height)? {
                Some(hash) => hashes.push(hash),
                None => break,
            }
        }
        Ok(hashes)
    }

    /// Confirmed main-chain transaction lookup; returns the transaction and
    /// the hash of its containing block.
    pub fn get_transaction_by_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<(Transaction, HashHex)>, BlockchainError> {
        let block_hash = match self.db.get(tx_key(tx_hash)).map_err(store_err)? {
            Some(bytes) => String::from_utf8(bytes.to_vec()).map_err(store_err)?,
            None => return Ok(None),
        };
        let block = self
            .get_block_by_hash(&block_hash)?
            .ok_or_else(|| BlockchainError::Store("dangling transaction index entry".into()))?;
        Ok(block
            .transactions
            .into_iter()
            .find(|tx| tx.tx_hash == tx_hash)
            .map(|tx| (tx, block_hash)))
    }

    pub fn get_transaction_hashes_by_block_hash(
        &self,
        block_hash: &str,
    ) -> Result<Option<Vec<HashHex>>, BlockchainError> {
        Ok(self.get_block_by_hash(block_hash)?.map(|block| {
            block
                .transactions
                .iter()
                .map(|tx| tx.tx_hash.clone())
                .collect()
        }))
    }

    /// Whether `tx_hash` is confirmed on the branch ending at `head_hash`.
    /// Resolves via the index when the branch is the main chain and walks
    /// parent pointers otherwise.
    pub fn transaction_on_branch(
        &self,
        tx_hash: &str,
        head_hash: &str,
    ) -> Result<bool, BlockchainError> {
        let head = match self.record(head_hash)? {
            Some(record) => record,
            None => return Ok(false),
        };
        if self.on_main_chain(head.block.height, head_hash)? {
            return Ok(self.db.get(tx_key(tx_hash)).map_err(store_err)?.is_some());
        }
        self.walk_branch(head, |block| {
            block.transactions.iter().any(|tx| tx.tx_hash == tx_hash)
        })
    }

    /// Transactions on the main chain touching `address`, oldest first.
    pub fn get_transaction_history(
        &self,
        address: &str,
    ) -> Result<Vec<Transaction>, BlockchainError> {
        let mut history = Vec::new();
        for hash in self.main_chain_hashes()? {
            let block = self
                .get_block_by_hash(&hash)?
                .ok_or_else(|| BlockchainError::Store("dangling height index entry".into()))?;
            for tx in block.transactions {
                if tx.source == address || tx.destination == address {
                    history.push(tx);
                }
            }
        }
        Ok(history)
    }

    /// Native-asset balance of `address` over the main chain.
    pub fn get_balance(&self, address: &str) -> Result<i64, BlockchainError> {
        self.get_balance_for_asset(address, groat_core::NATIVE_ASSET)
    }

    /// Credits minus debits and fees over all main-chain transactions of
    /// `asset` with a transfer type (asset creation is excluded).
    pub fn get_balance_for_asset(
        &self,
        address: &str,
        asset: &str,
    ) -> Result<i64, BlockchainError> {
        let mut balance = 0i64;
        for hash in self.main_chain_hashes()? {
            let block = self
                .get_block_by_hash(&hash)?
                .ok_or_else(|| BlockchainError::Store("dangling height index entry".into()))?;
            balance += balance_delta(&block, address, asset);
        }
        Ok(balance)
    }

    /// Balance of `address` along the branch ending at `head_hash`, walking
    /// parent pointers back to genesis. Used when validating fork branches.
    pub fn get_balance_on_branch(
        &self,
        address: &str,
        head_hash: &str,
    ) -> Result<i64, BlockchainError> {
        let head = match self.record(head_hash)? {
            Some(record) => record,
            None => return Ok(0),
        };
        if self.on_main_chain(head.block.height, head_hash)? {
            return self.get_balance(address);
        }
        let mut balance = 0i64;
        self.walk_branch(head, |block| {
            balance += balance_delta(block, address, groat_core::NATIVE_ASSET);
            false
        })?;
        Ok(balance)
    }

    /// Walks `head` back to genesis, calling `visit` per block; stops early
    /// when `visit` returns true (and returns true).
    fn walk_branch(
        &self,
        head: StoredBlock,
        mut visit: impl FnMut(&Block) -> bool,
    ) -> Result<bool, BlockchainError> {
        let mut current = head;
        loop {
            if visit(&current.block) {
                return Ok(true);
            }
            if current.block.height == 0 {
                return Ok(false);
            }
            current = self
                .record(&current.block.header.previous_hash)?
                .ok_or_else(|| {
                    BlockchainError::Store(format!(
                        "broken parent link below block {}",
                        current.block.height
                    ))
                })?;
        }
    }

    fn main_chain_hashes(&self) -> Result<Vec<HashHex>, BlockchainError> {
        // snapshot the index up front so the scan never holds the iterator
        // across block loads
        let mut hashes = Vec::new();
        for entry in self.db.scan_prefix(b"height:") {
            let (_, value) = entry.map_err(store_err)?;
            hashes.push(String::from_utf8(value.to_vec()).map_err(store_err)?);
        }
        Ok(hashes)
    }

    pub fn reward(&self, height: u64) -> u64 {
        self.params.reward(height)
    }

    /// Leading-zero count required of a block at `height` whose parent is
    /// `parent_hash`. Below the adjustment span the floor applies; past it,
    /// the delta between the parent and the block one span earlier is
    /// compared against the target window.
    pub fn required_difficulty(
        &self,
        height: u64,
        parent_hash: &str,
    ) -> Result<usize, BlockchainError> {
        let span = self.params.difficulty_adjustment_span;
        let minimum = self.params.minimum_hash_difficulty;
        if height <= span {
            return Ok(minimum);
        }
        let parent = self
            .record(parent_hash)?
            .ok_or_else(|| BlockchainError::ChainContinuity(height, "unknown parent".into()))?;
        let anchor_height = height - 1 - span;
        let anchor = self.block_at_on_branch(&parent, anchor_height)?;
        let delta = parent
            .block
            .header
            .timestamp
            .saturating_sub(anchor.header.timestamp);
        let window = self.params.target_time_per_block * span;
        let parent_difficulty = parent.block.header.hash_difficulty();
        let required = if delta < window {
            parent_difficulty + 1
        } else if delta > window {
            parent_difficulty.saturating_sub(1)
        } else {
            parent_difficulty
        };
        Ok(required.max(minimum))
    }

    /// Resolves the block at `height` on the branch containing `from`,
    /// preferring the height index when the branch is the main chain.
    fn block_at_on_branch(
        &self,
        from: &StoredBlock,
        height: u64,
    ) -> Result<Block, BlockchainError> {
        if self.on_main_chain(from.block.height, &from.block.header.hash())? {
            return self
                .get_block_by_height(height)?
                .ok_or_else(|| BlockchainError::Store("missing main-chain block".into()));
        }
        let mut current = from.clone();
        while current.block.height > height {
            current = self
                .record(&current.block.header.previous_hash)?
                .ok_or_else(|| BlockchainError::Store("broken parent link".into()))?;
        }
        Ok(current.block)
    }

    /// Persists `block`, tracking branch membership and reorganizing when a
    /// side branch overtakes the main chain. Rule checks beyond structure
    /// (proof-of-work, signatures, funds) belong to the validator; the store
    /// verifies linkage so its indexes stay consistent.
    pub fn append(&self, block: &Block) -> Result<AppendOutcome, BlockchainError> {
        let _guard = self.write_lock.lock();
        let hash = block.header.hash();
        if self.record(&hash)?.is_some() {
            return Ok(AppendOutcome::Rejected(BlockchainError::ChainContinuity(
                block.height,
                format!("block {hash} already recorded"),
            )));
        }
        if block.height == 0 {
            // the only valid genesis was written at bootstrap
            return Ok(AppendOutcome::Rejected(BlockchainError::GenesisMismatch));
        }
        if let Err(err) = block.verify_internal() {
            return Ok(AppendOutcome::Rejected(err));
        }
        let parent = match self.record(&block.header.previous_hash)? {
            Some(parent) => parent,
            None => return Ok(AppendOutcome::Orphan),
        };
        if parent.block.height + 1 != block.height {
            return Ok(AppendOutcome::Rejected(BlockchainError::ChainContinuity(
                block.height,
                format!(
                    "parent {} is at height {}",
                    block.header.previous_hash, parent.block.height
                ),
            )));
        }

        let mut writes: WriteSet = Vec::new();
        let parent_head = self.branch_head(parent.branch)?.ok_or_else(|| {
            BlockchainError::Store(format!("missing head for branch {}", parent.branch))
        })?;
        let branch = if parent_head.head == block.header.previous_hash {
            parent.branch
        } else {
            // parent is mid-branch: this block starts a fork
            let next = self.meta_u64(BRANCH_SEQ_KEY)?;
            writes.push((
                BRANCH_SEQ_KEY.to_vec(),
                Some((next + 1).to_be_bytes().to_vec()),
            ));
            next
        };

        let record = StoredBlock {
            branch,
            block: block.clone(),
        };
        writes.push((block_key(&hash), Some(encode(&record)?)));
        writes.push((
            branch_key(branch),
            Some(encode(&BranchHead {
                head: hash.clone(),
                height: block.height,
            })?),
        ));

        let main_branch = self.meta_u64(MAIN_BRANCH_KEY)?;
        let tip = self.tip()?;

        if branch == main_branch {
            writes.push((height_key(block.height), Some(hash.as_bytes().to_vec())));
            for tx in &block.transactions {
                writes.push((tx_key(&tx.tx_hash), Some(hash.as_bytes().to_vec())));
            }
            writes.push((TIP_KEY.to_vec(), Some(hash.as_bytes().to_vec())));
            self.commit(writes)?;
            debug!(height = block.height, hash = %hash, "extended main chain");
            return Ok(AppendOutcome::Applied {
                confirmed: spending_transactions(std::slice::from_ref(block)),
                reinstated: Vec::new(),
            });
        }

        if block.height <= tip.height {
            // side branch not yet taller than the main chain
            self.commit(writes)?;
            debug!(height = block.height, hash = %hash, branch, "recorded fork block");
            return Ok(AppendOutcome::Applied {
                confirmed: Vec::new(),
                reinstated: Vec::new(),
            });
        }

        // The fork overtook the main chain: promote it.
        let (joining, leaving) = self.reorg_plan(block, &parent, tip.height)?;
        for left in &leaving {
            writes.push((height_key(left.height), None));
            for tx in &left.transactions {
                writes.push((tx_key(&tx.tx_hash), None));
            }
        }
        for joined in &joining {
            let joined_hash = joined.header.hash();
            writes.push((
                height_key(joined.height),
                Some(joined_hash.as_bytes().to_vec()),
            ));
            for tx in &joined.transactions {
                writes.push((tx_key(&tx.tx_hash), Some(joined_hash.as_bytes().to_vec())));
            }
        }
        writes.push((TIP_KEY.to_vec(), Some(hash.as_bytes().to_vec())));
        writes.push((MAIN_BRANCH_KEY.to_vec(), Some(branch.to_be_bytes().to_vec())));
        self.commit(writes)?;
        info!(
            height = block.height,
            hash = %hash,
            leaving = leaving.len(),
            joining = joining.len(),
            "reorganized to taller branch"
        );

        let confirmed = spending_transactions(&joining);
        let confirmed_hashes: HashSet<&str> =
            confirmed.iter().map(|tx| tx.tx_hash.as_str()).collect();
        let reinstated = spending_transactions(&leaving)
            .into_iter()
            .filter(|tx| !confirmed_hashes.contains(tx.tx_hash.as_str()))
            .collect();
        Ok(AppendOutcome::Applied {
            confirmed,
            reinstated,
        })
    }

    /// Blocks joining the main chain (ascending, ending in the new tip) and
    /// blocks leaving it (ascending), split at the common ancestor.
    fn reorg_plan(
        &self,
        block: &Block,
        parent: &StoredBlock,
        main_height: u64,
    ) -> Result<(Vec<Block>, Vec<Block>), BlockchainError> {
        let mut joining = vec![block.clone()];
        let mut cursor = parent.clone();
        loop {
            let cursor_hash = cursor.block.header.hash();
            if self.on_main_chain(cursor.block.height, &cursor_hash)? {
                break;
            }
            joining.push(cursor.block.clone());
            cursor = self
                .record(&cursor.block.header.previous_hash)?
                .ok_or_else(|| BlockchainError::Store("broken parent link in fork".into()))?;
        }
        joining.reverse();
        let ancestor_height = cursor.block.height;

        let mut leaving = Vec::new();
        for height in (ancestor_height + 1)..=main_height {
            let hash = self.main_hash_at(height)?.ok_or_else(|| {
                BlockchainError::Store("gap in main-chain height index".into())
            })?;
            let left = self
                .get_block_by_hash(&hash)?
                .ok_or_else(|| BlockchainError::Store("dangling height index entry".into()))?;
            leaving.push(left);
        }
        Ok((joining, leaving))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BlockchainError> {
    serde_json::to_vec(value).map_err(store_err)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, BlockchainError> {
    serde_json::from_slice(bytes).map_err(store_err)
}

/// Non-coinbase transactions of `blocks`, in block order.
fn spending_transactions(blocks: &[Block]) -> Vec<Transaction> {
    blocks
        .iter()
        .flat_map(|block| block.transactions.iter().skip(1).cloned())
        .collect()
}

fn balance_delta(block: &Block, address: &str, asset: &str) -> i64 {
    let mut delta = 0i64;
    for tx in &block.transactions {
        if tx.tx_type == groat_core::TxType::AssetCreation || tx.asset != asset {
            continue;
        }
        if tx.destination == address {
            delta += tx.amount as i64;
        }
        if tx.source == address {
            delta -= (tx.amount + tx.fee) as i64;
        }
    }
    delta
}
