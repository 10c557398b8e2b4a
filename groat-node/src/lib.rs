use anyhow::{anyhow, Context, Result};
use groat_config::{NetworkConfig, NodeConfig};
use groat_consensus::{Miner, Validator};
use groat_core::{
    Block, BlockchainError, ChainParams, MessageType, Transaction, MAX_HASH_RANGE,
};
use groat_mempool::{Mempool, DEFAULT_TX_TTL_SECS};
use groat_network::{Envelope, PeerClient, PeerRegistry};
use groat_rpc::RpcState;
use groat_storage::{AppendOutcome, ChainStore};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const INBOUND_QUEUE_DEPTH: usize = 1024;
const PEER_MAINTENANCE_SECS: u64 = 30;

pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn chain_params(network: &NetworkConfig) -> ChainParams {
    ChainParams {
        initial_coins_per_block: network.initial_coins_per_block,
        halving_frequency: network.halving_frequency,
        significant_digits: network.significant_digits,
        minimum_hash_difficulty: network.minimum_hash_difficulty,
        target_time_per_block: network.target_time_per_block,
        difficulty_adjustment_span: network.difficulty_adjustment_span,
        version: network.version,
    }
}

/// Consumes the inbound work queue and drives the chain store, mempool, and
/// validator. All mutating events are serialized through this single
/// consumer; the miner and the HTTP handlers only produce.
pub struct Dispatcher {
    store: Arc<ChainStore>,
    mempool: Arc<Mempool>,
    validator: Validator,
    peers: Arc<PeerRegistry>,
    client: Arc<PeerClient>,
    own_host: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ChainStore>,
        mempool: Arc<Mempool>,
        validator: Validator,
        peers: Arc<PeerRegistry>,
        client: Arc<PeerClient>,
        own_host: String,
    ) -> Self {
        Self {
            store,
            mempool,
            validator,
            peers,
            client,
            own_host,
        }
    }

    pub async fn run(self, mut inbound: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            if let Err(err) = self.handle(envelope).await {
                if let BlockchainError::PeerUnreachable(host) = &err {
                    self.peers.record_downtime(host);
                }
                warn!(%err, "inbound message handling failed");
            }
        }
        info!("inbound queue closed; dispatcher stopping");
    }

    pub async fn handle(&self, envelope: Envelope) -> Result<(), BlockchainError> {
        let sender = envelope.host.clone();
        match envelope.msg_type {
            MessageType::BlockHeader => {
                let Ok(block) = serde_json::from_value::<Block>(envelope.data) else {
                    warn!(peer = %sender, "malformed block payload");
                    return Ok(());
                };
                self.handle_block(block, &sender).await
            }
            MessageType::BlockInv => {
                let Ok(block_hash) = serde_json::from_value::<String>(envelope.data) else {
                    warn!(peer = %sender, "malformed block inventory");
                    return Ok(());
                };
                if self.store.get_header_by_hash(&block_hash)?.is_some() {
                    return Ok(());
                }
                let block = self.fetch_block(&sender, &block_hash).await?;
                self.handle_block(block, &sender).await
            }
            MessageType::UnconfirmedTransaction => {
                let Ok(tx) = serde_json::from_value::<Transaction>(envelope.data) else {
                    warn!(peer = %sender, "malformed transaction payload");
                    return Ok(());
                };
                self.handle_unconfirmed(tx, &sender).await
            }
            MessageType::TransactionInv => {
                let Ok(tx_hash) = serde_json::from_value::<String>(envelope.data) else {
                    warn!(peer = %sender, "malformed transaction inventory");
                    return Ok(());
                };
                if self.mempool.contains(&tx_hash)
                    || self.store.get_transaction_by_hash(&tx_hash)?.is_some()
                {
                    return Ok(());
                }
                let tx = self.client.get_transaction(&sender, &tx_hash).await?;
                if tx.tx_hash != tx_hash {
                    warn!(peer = %sender, "peer served a transaction under the wrong hash");
                    return Ok(());
                }
                self.handle_unconfirmed(tx, &sender).await
            }
        }
    }

    /// Validates and appends a block, reconciling forks first when its
    /// parent is unknown and it claims to extend past the local tip.
    async fn handle_block(&self, block: Block, sender: &str) -> Result<(), BlockchainError> {
        let hash = block.header.hash();
        if self.store.get_header_by_hash(&hash)?.is_some() {
            return Ok(());
        }
        if block.height > 0
            && self
                .store
                .get_header_by_hash(&block.header.previous_hash)?
                .is_none()
        {
            let local_height = self.store.height()?;
            if block.height <= local_height {
                debug!(height = block.height, "ignoring orphan below local tip");
                return Ok(());
            }
            if sender.is_empty() || sender == self.own_host {
                warn!(height = block.height, "orphan block with no peer to sync from");
                return Ok(());
            }
            self.reconcile(sender, block.height).await?;
            if self.store.get_header_by_hash(&hash)?.is_some() {
                return Ok(());
            }
            if self
                .store
                .get_header_by_hash(&block.header.previous_hash)?
                .is_none()
            {
                warn!(height = block.height, "parent still unknown after sync");
                return Ok(());
            }
        }

        if let Err(err) = self.validator.validate_block(&block) {
            warn!(height = block.height, %err, "block failed validation");
            return Ok(());
        }
        match self.store.append(&block)? {
            AppendOutcome::Applied {
                confirmed,
                reinstated,
            } => {
                self.apply_mempool_effects(confirmed, reinstated);
                info!(height = block.height, hash = %hash, "applied block");
                if sender == self.own_host {
                    // locally mined: announce the full header to everyone
                    let envelope = Envelope::new(MessageType::BlockHeader, &block, &self.own_host);
                    self.client.broadcast(&self.peers, &envelope, None).await;
                } else {
                    let envelope = Envelope::new(MessageType::BlockInv, &hash, &self.own_host);
                    self.client
                        .broadcast(&self.peers, &envelope, Some(sender))
                        .await;
                }
            }
            AppendOutcome::Orphan => {
                warn!(height = block.height, "block orphaned after reconciliation");
            }
            AppendOutcome::Rejected(reason) => {
                debug!(height = block.height, %reason, "block not appended");
            }
        }
        Ok(())
    }

    async fn handle_unconfirmed(
        &self,
        tx: Transaction,
        sender: &str,
    ) -> Result<(), BlockchainError> {
        if let Err(err) = self.validator.validate_transaction(&tx) {
            debug!(tx = %tx.tx_hash, %err, "transaction refused");
            return Ok(());
        }
        let tx_hash = tx.tx_hash.clone();
        if self.mempool.push(tx) {
            let envelope = Envelope::new(MessageType::TransactionInv, &tx_hash, &self.own_host);
            self.client
                .broadcast(&self.peers, &envelope, Some(sender))
                .await;
        }
        Ok(())
    }

    /// Rebuilds a full block from a peer: header, then the transaction-hash
    /// inventory, then any transactions not already known locally.
    async fn fetch_block(&self, peer: &str, block_hash: &str) -> Result<Block, BlockchainError> {
        let view = self.client.get_header_by_hash(peer, block_hash).await?;
        let tx_hashes = self
            .client
            .get_transaction_hashes_by_block(peer, block_hash)
            .await?;
        let mut transactions = Vec::with_capacity(tx_hashes.len());
        for tx_hash in tx_hashes {
            let known = if let Some(tx) = self.mempool.get(&tx_hash) {
                Some(tx)
            } else {
                self.store
                    .get_transaction_by_hash(&tx_hash)?
                    .map(|(tx, _)| tx)
            };
            let tx = match known {
                Some(tx) => tx,
                None => self.client.get_transaction(peer, &tx_hash).await?,
            };
            transactions.push(tx);
        }
        Ok(Block {
            height: view.height,
            header: view.header,
            transactions,
        })
    }

    /// Fork reconciliation: walk the peer's hash ranges backward from the
    /// claimed height until a locally-known ancestor appears, then fetch,
    /// validate, and append every missing block in order. The store's reorg
    /// rule promotes the branch once it outgrows the local main chain.
    async fn reconcile(&self, peer: &str, claimed_height: u64) -> Result<(), BlockchainError> {
        info!(peer = %peer, claimed_height, "reconciling fork");
        let mut missing: Vec<String> = Vec::new();
        let mut end = claimed_height;
        loop {
            let start = end.saturating_sub(MAX_HASH_RANGE);
            let hashes = self.client.get_hashes_range(peer, start, end).await?;
            let mut window: Vec<String> = Vec::new();
            let mut found_ancestor = false;
            for hash in hashes.into_iter().rev() {
                if self.store.get_header_by_hash(&hash)?.is_some() {
                    found_ancestor = true;
                    break;
                }
                window.push(hash);
            }
            window.reverse();
            window.extend(missing);
            missing = window;
            if found_ancestor {
                break;
            }
            if start == 0 {
                // walked all the way down without touching our chain
                return Err(BlockchainError::GenesisMismatch);
            }
            end = start - 1;
        }
        debug!(peer = %peer, blocks = missing.len(), "downloading fork branch");
        for block_hash in missing {
            if self.store.get_header_by_hash(&block_hash)?.is_some() {
                continue;
            }
            let block = self.fetch_block(peer, &block_hash).await?;
            self.validator.validate_block(&block)?;
            match self.store.append(&block)? {
                AppendOutcome::Applied {
                    confirmed,
                    reinstated,
                } => self.apply_mempool_effects(confirmed, reinstated),
                AppendOutcome::Orphan => {
                    return Err(BlockchainError::ChainContinuity(
                        block.height,
                        "fork block orphaned mid-sync".into(),
                    ))
                }
                AppendOutcome::Rejected(reason) => return Err(reason),
            }
        }
        Ok(())
    }

    fn apply_mempool_effects(&self, confirmed: Vec<Transaction>, reinstated: Vec<Transaction>) {
        if !confirmed.is_empty() {
            self.mempool.remove_batch(&confirmed);
        }
        for tx in reinstated {
            self.mempool.push(tx);
        }
        self.mempool.prune_expired(DEFAULT_TX_TTL_SECS);
    }
}

/// Mining thread body: search, submit through the dispatcher (the same
/// append path as peer blocks), wait for the tip to move, repeat.
fn mine_loop(
    miner: Miner,
    store: Arc<ChainStore>,
    inbound: mpsc::Sender<Envelope>,
    own_host: String,
) {
    info!("miner started");
    while !miner.stopped() {
        match miner.mine_next() {
            Ok(Some(block)) => {
                let height = block.height;
                let envelope = Envelope::new(MessageType::BlockHeader, &block, &own_host);
                if inbound.blocking_send(envelope).is_err() {
                    break;
                }
                // give the dispatcher time to apply before assembling the
                // next candidate on the same parent
                let mut waited = 0u32;
                while !miner.stopped() && waited < 100 {
                    match store.height() {
                        Ok(h) if h >= height => break,
                        _ => {
                            std::thread::sleep(Duration::from_millis(50));
                            waited += 1;
                        }
                    }
                }
            }
            Ok(None) => continue,
            Err(err) => {
                warn!(%err, "mining attempt failed");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
    info!("miner stopped");
}

async fn maintain_peers(
    client: Arc<PeerClient>,
    peers: Arc<PeerRegistry>,
    seeds: Vec<String>,
    own_host: String,
    network: Arc<serde_json::Value>,
    min_peers: usize,
    max_peers: usize,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(PEER_MAINTENANCE_SECS));
    loop {
        ticker.tick().await;
        client
            .check_peers(&peers, &seeds, &own_host, &network, min_peers, max_peers)
            .await;
    }
}

/// Brings up the full node: chain store, mempool, peer registry, dispatcher,
/// HTTP API, peer maintenance, and (optionally) the miner. Blocks until
/// ctrl-c, then shuts the pieces down in order.
pub async fn run_node(config: NodeConfig, mine: bool) -> Result<()> {
    let network = config.network.clone();
    let store = Arc::new(ChainStore::open(&config.user.db, chain_params(&network))?);
    let mempool = Arc::new(Mempool::new());
    let peers = Arc::new(PeerRegistry::new(
        network.downtime_threshold,
        network.max_peers,
    ));
    let client = Arc::new(PeerClient::new(network.full_node_port)?);
    let validator = Validator::new(store.clone(), mempool.clone());
    let network_value = Arc::new(serde_json::to_value(&network)?);
    let own_host = config.user.ip.clone();
    let (inbound_tx, inbound_rx) = mpsc::channel::<Envelope>(INBOUND_QUEUE_DEPTH);

    let rpc_state = RpcState {
        store: store.clone(),
        mempool: mempool.clone(),
        peers: peers.clone(),
        client: client.clone(),
        validator: validator.clone(),
        network: network_value.clone(),
        inbound: inbound_tx.clone(),
        own_host: own_host.clone(),
    };
    let addr: SocketAddr = format!("0.0.0.0:{}", network.full_node_port)
        .parse()
        .context("bad listen address")?;
    let server = tokio::spawn(groat_rpc::serve(addr, rpc_state));

    let dispatcher = Dispatcher::new(
        store.clone(),
        mempool.clone(),
        validator,
        peers.clone(),
        client.clone(),
        own_host.clone(),
    );
    let dispatch_task = tokio::spawn(dispatcher.run(inbound_rx));

    let maintenance = tokio::spawn(maintain_peers(
        client,
        peers,
        config.user.seed_nodes.clone(),
        own_host.clone(),
        network_value,
        network.min_peers,
        network.max_peers,
    ));

    let stop = Arc::new(AtomicBool::new(false));
    let miner_thread = if mine {
        let reward_address = config.user.public_key.clone();
        if reward_address.is_empty() {
            return Err(anyhow!("mining requires user.public_key in the config"));
        }
        info!(reward = %reward_address, "mining enabled");
        let miner = Miner::new(
            store.clone(),
            mempool,
            reward_address,
            network.max_transactions_per_block,
            stop.clone(),
        );
        let submit = inbound_tx.clone();
        let miner_store = store.clone();
        let miner_host = own_host;
        Some(std::thread::spawn(move || {
            mine_loop(miner, miner_store, submit, miner_host)
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown signal received");
    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = miner_thread {
        let _ = tokio::task::spawn_blocking(move || handle.join()).await;
    }
    maintenance.abort();
    server.abort();
    drop(inbound_tx);
    let _ = dispatch_task.await;
    info!("node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use groat_core::{HeaderView, TxType};
    use groat_crypto::KeyPair;
    use serde_json::json;

    fn test_params() -> ChainParams {
        ChainParams {
            initial_coins_per_block: 50,
            halving_frequency: 100,
            significant_digits: 2,
            minimum_hash_difficulty: 0,
            target_time_per_block: 60,
            difficulty_adjustment_span: 10,
            version: 1,
        }
    }

    fn child_block(
        store: &ChainStore,
        parent: &HeaderView,
        reward_address: &str,
        extra: Vec<Transaction>,
        timestamp: u64,
    ) -> Block {
        let height = parent.height + 1;
        let fees: u64 = extra.iter().map(|tx| tx.fee).sum();
        let mut transactions = vec![Transaction::coinbase(
            reward_address,
            store.reward(height) + fees,
        )];
        transactions.extend(extra);
        Block::new(height, transactions, parent.hash.clone(), timestamp, 1)
    }

    fn dispatcher_for(
        store: &Arc<ChainStore>,
        mempool: &Arc<Mempool>,
        peer_port: u16,
    ) -> Dispatcher {
        Dispatcher::new(
            store.clone(),
            mempool.clone(),
            Validator::new(store.clone(), mempool.clone()),
            Arc::new(PeerRegistry::new(3, 8)),
            Arc::new(PeerClient::new(peer_port).unwrap()),
            "10.0.0.1".to_string(),
        )
    }

    /// Serves `store`/`mempool` over a real HTTP listener on an ephemeral
    /// port, acting as the remote peer.
    async fn spawn_peer_server(store: Arc<ChainStore>, mempool: Arc<Mempool>) -> u16 {
        let validator = Validator::new(store.clone(), mempool.clone());
        let (inbound, receiver) = mpsc::channel(16);
        std::mem::forget(receiver);
        let state = RpcState {
            store,
            mempool,
            peers: Arc::new(PeerRegistry::new(3, 8)),
            client: Arc::new(PeerClient::new(1).unwrap()),
            validator,
            network: Arc::new(json!({})),
            inbound,
            own_host: "127.0.0.1".into(),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, groat_rpc::router(state)).await;
        });
        port
    }

    #[tokio::test]
    async fn mined_block_flows_through_the_dispatcher() {
        let store = Arc::new(ChainStore::open_temporary(test_params()).unwrap());
        let mempool = Arc::new(Mempool::new());
        let kp = KeyPair::generate();
        let stop = Arc::new(AtomicBool::new(false));
        let miner = Miner::new(
            store.clone(),
            mempool.clone(),
            kp.public_key_hex(),
            10,
            stop,
        );
        let block = miner.mine_next().unwrap().unwrap();

        let dispatcher = dispatcher_for(&store, &mempool, 1);
        let envelope = Envelope::new(MessageType::BlockHeader, &block, "10.0.0.1");
        dispatcher.handle(envelope).await.unwrap();

        assert_eq!(store.height().unwrap(), 1);
        assert_eq!(
            store.get_balance(&kp.public_key_hex()).unwrap(),
            store.reward(1) as i64
        );
    }

    #[tokio::test]
    async fn fork_reconciliation_adopts_taller_peer_chain() {
        let kp_a = KeyPair::generate();
        let kp_b = KeyPair::generate();
        let node_store = Arc::new(ChainStore::open_temporary(test_params()).unwrap());
        let peer_store = Arc::new(ChainStore::open_temporary(test_params()).unwrap());

        // shared prefix: blocks 1..=3 mined to kp_a, identical on both sides
        for i in 1..=3u64 {
            let tip = node_store.tip().unwrap();
            let block = child_block(&node_store, &tip, &kp_a.public_key_hex(), vec![], i * 100);
            node_store.append(&block).unwrap();
            peer_store.append(&block).unwrap();
        }

        // local branch A: blocks 4 and 5, block 4 carries a transfer
        let mut transfer = Transaction::new(
            kp_a.public_key_hex(),
            kp_b.public_key_hex(),
            10,
            1,
            TxType::Standard,
            "0".to_string(),
        );
        transfer.sign(&kp_a);
        let tip = node_store.tip().unwrap();
        let a4 = child_block(
            &node_store,
            &tip,
            &kp_a.public_key_hex(),
            vec![transfer.clone()],
            410,
        );
        node_store.append(&a4).unwrap();
        let tip = node_store.tip().unwrap();
        let a5 = child_block(&node_store, &tip, &kp_a.public_key_hex(), vec![], 510);
        node_store.append(&a5).unwrap();
        assert_eq!(node_store.height().unwrap(), 5);

        // peer branch B: blocks 4'..=6' mined to kp_b
        for ts in [420u64, 520, 620] {
            let tip = peer_store.tip().unwrap();
            let block = child_block(&peer_store, &tip, &kp_b.public_key_hex(), vec![], ts);
            peer_store.append(&block).unwrap();
        }
        assert_eq!(peer_store.height().unwrap(), 6);
        let b6 = peer_store.get_block_by_height(6).unwrap().unwrap();

        let port = spawn_peer_server(peer_store.clone(), Arc::new(Mempool::new())).await;
        let node_mempool = Arc::new(Mempool::new());
        let dispatcher = dispatcher_for(&node_store, &node_mempool, port);

        // peer announces its tip, whose parent we do not know
        let envelope = Envelope::new(MessageType::BlockHeader, &b6, "127.0.0.1");
        dispatcher.handle(envelope).await.unwrap();

        assert_eq!(node_store.height().unwrap(), 6);
        assert_eq!(node_store.tip().unwrap().hash, b6.header.hash());
        // the transfer stranded on branch A is back in the mempool
        assert!(node_mempool.contains(&transfer.tx_hash));
        // and branch B's coinbases now pay kp_b on the main chain
        assert_eq!(
            node_store.get_balance(&kp_b.public_key_hex()).unwrap(),
            (node_store.reward(4) + node_store.reward(5) + node_store.reward(6)) as i64
        );
    }

    #[tokio::test]
    async fn transaction_inventory_pull_admits_the_transaction() {
        let kp = KeyPair::generate();
        let node_store = Arc::new(ChainStore::open_temporary(test_params()).unwrap());
        let peer_store = Arc::new(ChainStore::open_temporary(test_params()).unwrap());

        // both sides know block 1, funding kp
        let tip = node_store.tip().unwrap();
        let block = child_block(&node_store, &tip, &kp.public_key_hex(), vec![], 100);
        node_store.append(&block).unwrap();
        peer_store.append(&block).unwrap();

        let mut tx = Transaction::new(
            kp.public_key_hex(),
            KeyPair::generate().public_key_hex(),
            10,
            1,
            TxType::Standard,
            "0".to_string(),
        );
        tx.sign(&kp);

        let peer_mempool = Arc::new(Mempool::new());
        peer_mempool.push(tx.clone());
        let port = spawn_peer_server(peer_store, peer_mempool).await;

        let node_mempool = Arc::new(Mempool::new());
        let dispatcher = dispatcher_for(&node_store, &node_mempool, port);
        let envelope = Envelope::new(MessageType::TransactionInv, &tx.tx_hash, "127.0.0.1");
        dispatcher.handle(envelope).await.unwrap();

        assert!(node_mempool.contains(&tx.tx_hash));
        // a second announcement is a no-op
        let envelope = Envelope::new(MessageType::TransactionInv, &tx.tx_hash, "127.0.0.1");
        dispatcher.handle(envelope).await.unwrap();
        assert_eq!(node_mempool.count(), 1);
    }
}
