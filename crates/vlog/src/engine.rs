//! Core engine: the tree, its signed header, block storage and the oplog
//! behind one serialized state machine.

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::header::{Entry, Header, TreeUpgrade, UserDataUpdate};
use crate::mutex::{Mutex, MutexGuard};
use crate::nodestore::{InMemoryNodeStore, NodeStore};
use crate::oplog::Oplog;
use crate::signer::{Ed25519Signer, KeyPair, Signer};
use crate::storage::{BlockStore, InMemoryBlockStore, MemoryStorage, RandomAccess};
use crate::tree::{Batch, MerkleTree};
use crate::{
    BitfieldUpdate, CoreOptions, Error, Hash32, Proof, ProofRequest, ReorgBatch, Result,
    SignableFormat,
};

/// What an accepted update did to the log.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UpdateStatus(u8);

impl UpdateStatus {
    /// Blocks were filled in without changing the length
    pub const NONE: Self = Self(0);
    pub const APPENDED: Self = Self(0b01);
    pub const TRUNCATED: Self = Self(0b10);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn appended(self) -> bool {
        self.0 & Self::APPENDED.0 != 0
    }

    pub fn truncated(self) -> bool {
        self.0 & Self::TRUNCATED.0 != 0
    }
}

impl BitOr for UpdateStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpdateStatus({:#04b})", self.0)
    }
}

/// Passed to the update handler after every accepted mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub status: UpdateStatus,
    pub bitfield: Option<BitfieldUpdate>,
    pub value: Option<Vec<u8>>,
    /// Peer the update came from, `None` when local
    pub from: Option<u64>,
}

pub type UpdateHandler = Box<dyn Fn(&Update) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Opening,
    Ready,
    Appending,
    Truncating,
    Verifying,
    Closed,
}

/// Backing stores of a core, owned exclusively by it.
#[derive(Clone)]
pub struct CoreStorage<S, N, B> {
    pub oplog: S,
    pub tree: N,
    pub blocks: B,
}

impl CoreStorage<MemoryStorage, InMemoryNodeStore, InMemoryBlockStore> {
    pub fn in_memory() -> Self {
        Self {
            oplog: MemoryStorage::new(),
            tree: InMemoryNodeStore::new(),
            blocks: InMemoryBlockStore::new(),
        }
    }
}

struct State<S: RandomAccess, N: NodeStore, B: BlockStore> {
    header: Header,
    tree: MerkleTree<N>,
    blocks: B,
    oplog: Oplog<S>,
}

pub struct Core<S = MemoryStorage, N = InMemoryNodeStore, B = InMemoryBlockStore>
where
    S: RandomAccess,
    N: NodeStore,
    B: BlockStore,
{
    state: RwLock<State<S, N, B>>,
    mutex: Mutex,
    signer: Arc<dyn Signer>,
    format: SignableFormat,
    options: CoreOptions,
    on_update: RwLock<Option<UpdateHandler>>,
    phase: parking_lot::Mutex<Phase>,
    closed: AtomicBool,
}

impl<S: RandomAccess, N: NodeStore, B: BlockStore> Core<S, N, B> {
    /// Create a core, or recover one from its oplog.
    pub fn open(storage: CoreStorage<S, N, B>, options: CoreOptions) -> Result<Self> {
        let CoreStorage {
            oplog: oplog_storage,
            tree: mut tree_store,
            mut blocks,
        } = storage;

        let (mut oplog, recovered) = Oplog::open(oplog_storage)?;

        let stored = if options.overwrite { None } else { recovered.header };

        let (mut header, entries) = match stored {
            Some(buf) => (Header::decode(&buf)?, recovered.entries),
            None => {
                if !options.create_if_missing && !options.overwrite {
                    return Err(Error::InvalidOperation(
                        "no core is stored here and create_if_missing is off".into(),
                    ));
                }

                let key_pair = options.key_pair.clone().unwrap_or_else(KeyPair::generate);
                let header = Header::new(key_pair, options.signable_format());

                tree_store.clear()?;
                blocks.del(0, u64::MAX)?;
                oplog.flush(&header.encode()?)?;

                info!(overwrite = options.overwrite, "created new core");
                (header, Vec::new())
            }
        };

        if let Some(key_pair) = &options.key_pair {
            if key_pair.public_key != header.signer.public_key {
                return Err(Error::InvalidOperation(
                    "stored core belongs to another public key".into(),
                ));
            }
            if header.signer.secret_key.is_none() && key_pair.secret_key.is_some() {
                header.signer.secret_key = key_pair.secret_key;
            }
        }

        let signer: Arc<dyn Signer> = match &options.signer {
            Some(signer) => Arc::clone(signer),
            None => Arc::new(Ed25519Signer::new(&header.signer)?),
        };

        let tree = MerkleTree::open(
            tree_store,
            header.tree.length,
            header.tree.fork,
            header.tree.signature.clone(),
        )?;

        let core = Self {
            format: header.signable_format,
            state: RwLock::new(State {
                header,
                tree,
                blocks,
                oplog,
            }),
            mutex: Mutex::new(),
            signer,
            options,
            on_update: RwLock::new(None),
            phase: parking_lot::Mutex::new(Phase::Opening),
            closed: AtomicBool::new(false),
        };

        core.replay(&entries)?;
        core.set_phase(Phase::Ready);

        {
            let state = core.state.read();
            info!(
                length = state.tree.length(),
                fork = state.tree.fork(),
                replayed = entries.len(),
                "opened core"
            );
        }

        Ok(core)
    }

    fn replay(&self, entries: &[Vec<u8>]) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        for buf in entries {
            let entry = Entry::decode(buf)?;

            if let Some(update) = &entry.user_data {
                state
                    .header
                    .set_user_data(&update.key, update.value.as_deref());
            }

            let Some(upgrade) = entry.tree_upgrade else {
                for node in entry.tree_nodes {
                    state.tree.add_node(node);
                }
                continue;
            };

            let mut batch = state.tree.batch();
            batch.nodes = entry.tree_nodes;
            batch.restore_roots(&state.tree, upgrade.length)?;
            batch.fork = upgrade.fork;
            batch.ancestors = upgrade.ancestors;
            batch.signature = upgrade.signature;
            batch.upgraded = true;

            state.header.add_reorg_hint(
                upgrade.fork,
                upgrade.ancestors,
                self.options.max_reorg_hints,
            );

            let old_length = state.tree.length();
            batch.commit(&mut state.tree)?;
            sync_tree_header(&mut state.header, &state.tree);

            // The block deletion of a truncation may not have landed.
            if old_length > upgrade.ancestors {
                state
                    .blocks
                    .del(upgrade.ancestors, old_length - upgrade.ancestors)?;
            }
        }

        if !entries.is_empty() {
            debug!(
                entries = entries.len(),
                length = state.tree.length(),
                "replayed oplog"
            );
        }
        Ok(())
    }

    /// Called after every accepted mutation, outside of any internal lock.
    pub fn on_update(&self, handler: impl Fn(&Update) + Send + Sync + 'static) {
        *self.on_update.write() = Some(Box::new(handler));
    }

    pub fn length(&self) -> u64 {
        self.state.read().tree.length()
    }

    pub fn byte_length(&self) -> u64 {
        self.state.read().tree.byte_length()
    }

    pub fn fork(&self) -> u64 {
        self.state.read().tree.fork()
    }

    pub fn tree_hash(&self) -> Hash32 {
        self.state.read().tree.hash()
    }

    pub fn signature(&self) -> Option<Vec<u8>> {
        self.state.read().tree.signature().map(|s| s.to_vec())
    }

    pub fn header(&self) -> Header {
        self.state.read().header.clone()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.state.read().header.signer.public_key
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn user_data_value(&self, key: &str) -> Option<Vec<u8>> {
        self.state.read().header.user_data(key).map(|v| v.to_vec())
    }

    pub fn block(&self, index: u64) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.state.read().blocks.get(index)
    }

    /// Levels missing above flat index `index`.
    pub fn missing_nodes(&self, index: u64) -> Result<u64> {
        self.state.read().tree.missing_nodes(index)
    }

    /// Byte offset and size of block `index`.
    pub fn byte_range(&self, index: u64) -> Result<(u64, u64)> {
        self.state.read().tree.byte_range(index)
    }

    /// Block holding byte `bytes`, and the offset inside it.
    pub fn seek(&self, bytes: u64) -> Result<(u64, u64)> {
        self.state.read().tree.seek(bytes)
    }

    /// Answer a peer's request. Block values are inlined when asked for.
    pub fn proof(&self, request: &ProofRequest) -> Result<Proof> {
        self.check_open()?;
        let state = self.state.read();

        let mut proof = state.tree.proof(request)?;

        if let (Some(req), Some(block)) = (request.block, proof.block.as_mut()) {
            if req.value {
                let value = state.blocks.get(req.index)?.ok_or_else(|| {
                    Error::InvalidOperation(format!("block {} is not stored", req.index))
                })?;
                block.value = Some(value);
            }
        }

        Ok(proof)
    }

    /// Append `blocks` and return the position of the first one.
    pub async fn append(&self, blocks: &[Vec<u8>]) -> Result<u64> {
        let _guard = self.lock().await?;

        let (start, update) = {
            let mut guard = self.state.write();
            let state = &mut *guard;

            let start = state.tree.length();
            if blocks.is_empty() {
                return Ok(start);
            }

            self.set_phase(Phase::Appending);
            let result = self.append_locked(state, start, blocks);
            self.set_phase(Phase::Ready);

            (start, result?)
        };

        self.emit(update);
        Ok(start)
    }

    fn append_locked(&self, state: &mut State<S, N, B>, start: u64, blocks: &[Vec<u8>]) -> Result<Update> {
        let mut batch = state.tree.batch();
        for block in blocks {
            batch.append(block);
        }

        let signature = self.signer.sign(&self.signable(&batch))?;
        batch.set_signature(signature);

        state.blocks.put_batch(start, blocks)?;

        let bitfield = BitfieldUpdate {
            drop: false,
            start,
            length: blocks.len() as u64,
        };
        let entry = Entry {
            tree_nodes: batch.nodes.clone(),
            tree_upgrade: Some(tree_upgrade(&batch)),
            bitfield: Some(bitfield),
            ..Default::default()
        };
        state.oplog.append(&[entry.encode()?])?;

        batch.commit(&mut state.tree)?;
        sync_tree_header(&mut state.header, &state.tree);

        debug!(
            start,
            count = blocks.len(),
            length = state.tree.length(),
            byte_length = state.tree.byte_length(),
            "appended blocks"
        );

        self.maybe_flush(state);

        Ok(Update {
            status: UpdateStatus::APPENDED,
            bitfield: Some(bitfield),
            value: None,
            from: None,
        })
    }

    /// Cut the log to `length` blocks and move it to `fork`.
    pub async fn truncate(&self, length: u64, fork: u64) -> Result<()> {
        let _guard = self.lock().await?;

        let update = {
            let mut guard = self.state.write();
            let state = &mut *guard;

            if length > state.tree.length() {
                return Err(Error::InvalidOperation(format!(
                    "cannot truncate {} blocks to {length}",
                    state.tree.length()
                )));
            }

            self.set_phase(Phase::Truncating);
            let result = state.tree.truncate(length, fork).and_then(|mut batch| {
                let signature = self.signer.sign(&self.signable(&batch))?;
                batch.set_signature(signature);
                self.truncate_locked(state, batch, None)
            });
            self.set_phase(Phase::Ready);

            result?
        };

        self.emit(update);
        Ok(())
    }

    fn truncate_locked(&self, state: &mut State<S, N, B>, batch: Batch, from: Option<u64>) -> Result<Update> {
        let old_length = state.tree.length();
        let ancestors = batch.ancestors;
        let new_length = batch.length;
        let fork = batch.fork;

        let bitfield = BitfieldUpdate {
            drop: true,
            start: ancestors,
            length: old_length - ancestors,
        };
        let entry = Entry {
            tree_nodes: batch.nodes.clone(),
            tree_upgrade: Some(tree_upgrade(&batch)),
            bitfield: Some(bitfield),
            ..Default::default()
        };
        state.oplog.append(&[entry.encode()?])?;

        state
            .header
            .add_reorg_hint(fork, ancestors, self.options.max_reorg_hints);

        batch.commit(&mut state.tree)?;
        sync_tree_header(&mut state.header, &state.tree);

        if old_length > ancestors {
            state.blocks.del(ancestors, old_length - ancestors)?;
        }

        self.fold(state);

        let status = if new_length > ancestors {
            UpdateStatus::TRUNCATED | UpdateStatus::APPENDED
        } else {
            UpdateStatus::TRUNCATED
        };

        info!(
            from_length = old_length,
            ancestors,
            length = new_length,
            fork,
            "truncated log"
        );

        Ok(Update {
            status,
            bitfield: Some(bitfield),
            value: None,
            from,
        })
    }

    /// Apply a proof from a peer. Returns `Ok(false)` when the proof no
    /// longer applies: another fork, or an upgrade this core has already
    /// moved past.
    pub async fn verify(&self, proof: &Proof, from: Option<u64>) -> Result<bool> {
        self.check_open()?;

        let batch = {
            let state = self.state.read();

            if proof.fork != state.tree.fork() {
                debug!(fork = proof.fork, local = state.tree.fork(), "ignoring proof from another fork");
                return Ok(false);
            }
            if let Some(upgrade) = &proof.upgrade {
                if upgrade.start < state.tree.length() {
                    debug!(
                        start = upgrade.start,
                        length = state.tree.length(),
                        "ignoring stale upgrade"
                    );
                    return Ok(false);
                }
            }

            state.tree.verify(proof)?
        };

        if batch.is_upgraded() {
            self.check_signature(&batch)?;
        }

        let _guard = self.lock().await?;

        let update = {
            let mut guard = self.state.write();
            let state = &mut *guard;

            if !batch.commitable(&state.tree) {
                debug!(
                    length = state.tree.length(),
                    batch_length = batch.length(),
                    "tree moved while verifying, dropping proof"
                );
                return Ok(false);
            }

            self.set_phase(Phase::Verifying);
            let result = self.verify_locked(state, batch, proof, from);
            self.set_phase(Phase::Ready);

            result?
        };

        self.emit(update);
        Ok(true)
    }

    fn verify_locked(
        &self,
        state: &mut State<S, N, B>,
        batch: Batch,
        proof: &Proof,
        from: Option<u64>,
    ) -> Result<Update> {
        let block = proof
            .block
            .as_ref()
            .and_then(|b| b.value.as_ref().map(|v| (b.index, v.clone())));

        if let Some((index, value)) = &block {
            state.blocks.put(*index, value)?;
        }

        let bitfield = block.as_ref().map(|(index, _)| BitfieldUpdate {
            drop: false,
            start: *index,
            length: 1,
        });

        let upgraded = batch.is_upgraded();
        let entry = Entry {
            tree_nodes: batch.nodes.clone(),
            tree_upgrade: upgraded.then(|| tree_upgrade(&batch)),
            bitfield,
            ..Default::default()
        };
        state.oplog.append(&[entry.encode()?])?;

        batch.commit(&mut state.tree)?;
        if upgraded {
            sync_tree_header(&mut state.header, &state.tree);
        }

        debug!(
            upgraded,
            block = block.as_ref().map(|(index, _)| *index),
            length = state.tree.length(),
            "verified proof"
        );

        self.maybe_flush(state);

        Ok(Update {
            status: if upgraded {
                UpdateStatus::APPENDED
            } else {
                UpdateStatus::NONE
            },
            bitfield,
            value: block.map(|(_, value)| value),
            from,
        })
    }

    /// Start adopting a remote fork from its upgrade proof.
    pub fn start_reorg(&self, proof: &Proof) -> Result<ReorgBatch> {
        self.check_open()?;
        self.state.read().tree.reorg(proof)
    }

    /// Feed the answer to [`ReorgBatch::request`].
    pub fn update_reorg(&self, reorg: &mut ReorgBatch, proof: &Proof) -> Result<bool> {
        self.check_open()?;
        reorg.update(&self.state.read().tree, proof)
    }

    /// Apply a resolved reorg as one truncate-and-append.
    pub async fn reorg(&self, reorg: ReorgBatch, from: Option<u64>) -> Result<bool> {
        self.check_open()?;

        if !reorg.finished() {
            return Err(Error::InvalidOperation("reorg is still missing nodes".into()));
        }
        let batch = reorg.into_batch();
        self.check_signature(&batch)?;

        let _guard = self.lock().await?;

        let update = {
            let mut guard = self.state.write();
            let state = &mut *guard;

            if !batch.commitable(&state.tree) {
                warn!("tree moved while resolving reorg, dropping it");
                return Ok(false);
            }

            self.set_phase(Phase::Truncating);
            let result = self.truncate_locked(state, batch, from);
            self.set_phase(Phase::Ready);

            result?
        };

        self.emit(update);
        Ok(true)
    }

    /// Set or (with `None`) delete a user data key.
    pub async fn user_data(&self, key: &str, value: Option<&[u8]>) -> Result<()> {
        let _guard = self.lock().await?;

        let mut guard = self.state.write();
        let state = &mut *guard;

        let mut header = state.header.clone();
        if !header.set_user_data(key, value) {
            return Ok(());
        }
        Oplog::<S>::check_header(&header.encode()?)?;

        let entry = Entry {
            user_data: Some(UserDataUpdate {
                key: key.to_string(),
                value: value.filter(|v| !v.is_empty()).map(|v| v.to_vec()),
            }),
            ..Default::default()
        };
        state.oplog.append(&[entry.encode()?])?;
        state.header = header;

        debug!(key, deleted = value.map_or(true, |v| v.is_empty()), "updated user data");

        self.maybe_flush(state);
        Ok(())
    }

    /// Let queued operations finish, fold the oplog and refuse further use.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.mutex.destroy(None).await;

        let result = {
            let mut guard = self.state.write();
            self.flush_locked(&mut guard)
        };
        self.set_phase(Phase::Closed);

        info!("closed core");
        result
    }

    async fn lock(&self) -> Result<MutexGuard<'_>> {
        self.check_open()?;
        self.mutex.acquire().await.map_err(|e| match e {
            Error::Destroyed => Error::Closed,
            other => other,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn check_signature(&self, batch: &Batch) -> Result<()> {
        let signature = batch.signature().ok_or(Error::InvalidSignature)?;
        if !self.signer.verify(&self.signable(batch), signature) {
            warn!(length = batch.length(), fork = batch.fork(), "rejected upgrade with bad signature");
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    fn signable(&self, batch: &Batch) -> Vec<u8> {
        match self.format {
            SignableFormat::Current => batch.signable(),
            SignableFormat::Legacy => batch.signable_legacy(),
        }
    }

    fn maybe_flush(&self, state: &mut State<S, N, B>) {
        if state.oplog.length() >= self.options.flush_interval.max(1) {
            self.fold(state);
        }
    }

    /// Fold after a mutation that is already durable in the oplog. A failure
    /// leaves the entries in place and the next mutation tries again.
    fn fold(&self, state: &mut State<S, N, B>) {
        if let Err(err) = self.flush_locked(state) {
            warn!(%err, pending = state.oplog.length(), "deferring oplog fold");
        }
    }

    fn flush_locked(&self, state: &mut State<S, N, B>) -> Result<()> {
        state.tree.flush()?;
        state.oplog.flush(&state.header.encode()?)?;
        debug!(length = state.tree.length(), "folded oplog into header");
        Ok(())
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    fn emit(&self, update: Update) {
        if let Some(handler) = self.on_update.read().as_ref() {
            handler(&update);
        }
    }
}

fn tree_upgrade(batch: &Batch) -> TreeUpgrade {
    TreeUpgrade {
        fork: batch.fork,
        ancestors: batch.ancestors,
        length: batch.length,
        signature: batch.signature.clone(),
    }
}

fn sync_tree_header<N: NodeStore>(header: &mut Header, tree: &MerkleTree<N>) {
    header.tree.fork = tree.fork();
    header.tree.length = tree.length();
    header.tree.byte_length = tree.byte_length();
    header.tree.root_hash = tree.hash();
    header.tree.signature = tree.signature().map(|s| s.to_vec());
}
