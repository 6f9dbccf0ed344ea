//! The assembled device: owns every zone's state and drives the write,
//! read, and discard pipelines described in spec §4.8.
//!
//! Every zone thread in spec §5 is modeled here as a `parking_lot::Mutex`
//! around that zone's state plus a [`crate::gate::Gate`] standing in for the
//! suspension points where the original would park a VIO on a wait queue
//! and return control to the zone's message loop. A caller thread walks the
//! whole 12-step pipeline itself rather than bouncing through zone inboxes;
//! see the Design Notes in `SPEC_FULL.md` for why this crate models
//! zone-affine single-threaded actors as blocking critical sections instead
//! of an explicit message-passing runtime.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::admin::{AdminState, AdminStateMachine, DrainStrategy, LoadStrategy};
use crate::block_map::BlockMap;
use crate::config::VdoConfig;
use crate::data_vio::{DataVioPool, VioOperation};
use crate::error::{Result, VdoError};
use crate::gate::Gate;
use crate::hash_lock::{HashLockTable, JoinOutcome};
use crate::lock_counter::{LockCounter, ZoneType};
use crate::logical_lock::LogicalLockTable;
use crate::packed_block;
use crate::packer::{AddOutcome, Packer, PendingFragment};
use crate::recovery_journal::{JournalEntry, RecoveryJournal};
use crate::slab_depot::SlabDepot;
use crate::statistics::{Statistics, StatisticsSnapshot};
use crate::traits::{BlockCompressor, BlockDevice, ContentHasher, DedupeAdvisor};
use crate::types::{BlockMapEntry, Fingerprint, Lbn, MappingState, Pbn, VDO_BLOCK_SIZE};

/// Which refcount operation a mapping commit applies to the new PBN, beyond
/// the unconditional decrement of a replaced old mapping (spec §4.2, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefMode {
    /// Zero-block write: no new PBN to reference.
    None,
    /// Verified-duplicate or waiter-linked dedupe: bump an existing count.
    Increment,
    /// Freshly allocated, uncompressible block: commit its provisional claim.
    CommitProvisional,
    /// First fragment-holder of a newly allocated shared compressed block.
    FirstFragment,
    /// A later fragment-holder of an already-committed shared compressed
    /// block.
    SubsequentFragment,
}

/// Side-table entry recording what a compressed fragment still waiting in
/// the packer needs in order to finish its own mapping commit once the bin
/// it joined is flushed, since [`PendingFragment`] itself only carries the
/// bytes the packer cares about (spec §4.6).
#[derive(Clone, Copy)]
struct FragmentMeta {
    lbn: Lbn,
    logical_zone: u32,
    old_mapping: BlockMapEntry,
    fingerprint: Fingerprint,
}

/// One assembled vdo-core instance: every component from spec §3 wired
/// together behind its own lock, plus the external collaborators from
/// spec §6.
pub struct VdoInstance {
    config: VdoConfig,
    device: Arc<dyn BlockDevice>,
    advisor: Arc<dyn DedupeAdvisor>,
    compressor: Arc<dyn BlockCompressor>,
    hasher: Arc<dyn ContentHasher>,

    admin: Mutex<AdminStateMachine>,
    block_map: Mutex<BlockMap>,
    slab_depot: Mutex<SlabDepot>,
    recovery_journal: Mutex<RecoveryJournal>,
    lock_counter: Mutex<LockCounter>,
    hash_locks: Mutex<HashLockTable>,
    logical_locks: Vec<Mutex<LogicalLockTable>>,
    packer: Mutex<Packer>,
    pool: DataVioPool,
    fragment_meta: Mutex<HashMap<u32, FragmentMeta>>,
    /// Outcome of a packed fragment's flush, keyed by data-VIO id, consumed
    /// exactly once by the write call that is still blocked waiting for its
    /// own fragment to reach durability (spec §3, §4.6).
    fragment_results: Mutex<HashMap<u32, Result<()>>>,

    allocation_gate: Gate,
    journal_gate: Gate,
    logical_gates: Vec<Gate>,
    hash_lock_gate: Gate,
    packer_gate: Gate,

    stats: Statistics,

    /// Pure-compute worker pool for hashing and compression (spec §5's "CPU
    /// worker threads... no shared state"); zone threads hand a buffer in
    /// and block on the result rather than doing the work inline.
    cpu_pool: rayon::ThreadPool,
}

impl VdoInstance {
    /// Assemble a fresh instance. `device` must address at least
    /// `1 + config.physical_blocks` blocks: PBN 0 is the reserved zero
    /// block and is never allocated or written (spec §3). The instance
    /// starts in the `SAVED` admin state; call [`VdoInstance::load`] before
    /// issuing any I/O (spec §6).
    pub fn new(
        config: VdoConfig,
        device: Arc<dyn BlockDevice>,
        advisor: Arc<dyn DedupeAdvisor>,
        compressor: Arc<dyn BlockCompressor>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Result<Self> {
        config.validate().map_err(VdoError::assertion)?;

        let origin = Pbn::new(1)?;
        let slab_depot = SlabDepot::new(
            origin,
            config.slab_count(),
            config.slab_blocks,
            config.physical_zones,
            config.recovery_journal_entries_per_block as usize,
        );

        let logical_locks =
            (0..config.logical_zones).map(|_| Mutex::new(LogicalLockTable::new())).collect();
        let logical_gates = (0..config.logical_zones).map(|_| Gate::new()).collect();

        let cpu_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.cpu_workers.max(1))
            .thread_name(|i| format!("cpu-worker-{i}"))
            .build()
            .map_err(|e| VdoError::assertion(e.to_string()))?;

        Ok(Self {
            block_map: Mutex::new(BlockMap::new(config.logical_zones, 1024)),
            recovery_journal: Mutex::new(RecoveryJournal::new(
                config.recovery_journal_blocks as usize,
                config.recovery_journal_entries_per_block as usize,
            )),
            lock_counter: Mutex::new(LockCounter::new(
                config.recovery_journal_blocks as usize,
                config.logical_zones as usize,
                config.physical_zones as usize,
            )),
            hash_locks: Mutex::new(HashLockTable::new()),
            packer: Mutex::new(Packer::new(config.packer_bins_full_threshold, config.packer_flush_interval)),
            pool: DataVioPool::new(config.max_in_flight_vios),
            fragment_meta: Mutex::new(HashMap::new()),
            fragment_results: Mutex::new(HashMap::new()),
            slab_depot: Mutex::new(slab_depot),
            admin: Mutex::new(AdminStateMachine::new()),
            logical_locks,
            logical_gates,
            allocation_gate: Gate::new(),
            journal_gate: Gate::new(),
            hash_lock_gate: Gate::new(),
            packer_gate: Gate::new(),
            stats: Statistics::new(),
            cpu_pool,
            config,
            device,
            advisor,
            compressor,
            hasher,
        })
    }

    // ---- admin surface (spec §6) -----------------------------------

    pub fn load(&self, strategy: LoadStrategy) -> Result<()> {
        self.admin.lock().load(strategy)?;
        let mut depot = self.slab_depot.lock();
        for slab in depot.slabs.iter_mut() {
            slab.load()?;
        }
        Ok(())
    }

    pub fn drain(&self, strategy: DrainStrategy) -> Result<()> {
        self.admin.lock().drain(strategy)
    }

    pub fn resume(&self) -> Result<()> {
        self.admin.lock().resume()
    }

    pub fn prepare_to_allocate(&self) -> Result<()> {
        self.admin.lock().prepare_to_allocate()
    }

    pub fn prepare_to_grow(&self, new_physical_blocks: u64) -> Result<()> {
        self.admin.lock().prepare_to_grow(new_physical_blocks)
    }

    /// Commit a pending `prepare_to_grow`: append slabs to the depot and
    /// load each one (spec §6 admin surface).
    pub fn use_new_slabs(&self) -> Result<()> {
        let new_physical_blocks = self.admin.lock().use_new_slabs()?;
        let new_slab_count = new_physical_blocks.div_ceil(self.config.slab_blocks);
        let mut depot = self.slab_depot.lock();
        let added = depot.grow(
            new_slab_count,
            self.config.recovery_journal_entries_per_block as usize,
            self.config.physical_zones,
        );
        for n in added {
            depot.slab_mut(n)?.load()?;
        }
        Ok(())
    }

    pub fn abandon_new_slabs(&self) {
        self.admin.lock().abandon_new_slabs();
    }

    pub fn admin_state(&self) -> AdminState {
        self.admin.lock().state()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    fn enter_read_only(&self) {
        self.admin.lock().enter_read_only();
        self.stats.record_read_only_entry();
    }

    // ---- zone routing -------------------------------------------------

    fn logical_zone_for(&self, lbn: Lbn) -> u32 {
        self.block_map.lock().zone_for_lbn(lbn)
    }

    /// Deterministic LBN -> owning physical zone assignment for a fresh
    /// allocation. Spec §4.8 leaves the exact assignment policy open; this
    /// mirrors the logical zone's hash routing rather than round-robin so
    /// that repeated writes to the same LBN keep allocating from the same
    /// zone's allocator.
    fn physical_zone_route(&self, lbn: Lbn) -> u32 {
        (lbn.as_u64() % self.config.physical_zones as u64) as u32
    }

    fn physical_zone_of(&self, pbn: Pbn) -> Result<u32> {
        let depot = self.slab_depot.lock();
        let slab_number = depot.slab_number_for(pbn)?;
        Ok(SlabDepot::zone_for_slab(slab_number, self.config.physical_zones))
    }

    // ---- logical lock (spec §4.8 step 2) -------------------------------

    fn acquire_logical_lock(&self, zone: u32, lbn: Lbn, id: u32) {
        {
            let mut table = self.logical_locks[zone as usize].lock();
            if table.try_acquire(lbn, id) {
                return;
            }
        }
        loop {
            self.logical_gates[zone as usize].wait();
            let table = self.logical_locks[zone as usize].lock();
            if table.holder(lbn) == Some(id) {
                return;
            }
        }
    }

    fn release_logical_lock(&self, zone: u32, lbn: Lbn, id: u32) {
        {
            let mut table = self.logical_locks[zone as usize].lock();
            table.release(lbn, id);
        }
        self.logical_gates[zone as usize].notify_all();
    }

    // ---- allocation (spec §4.4) -----------------------------------------

    fn allocate_blocking(&self, zone: u32) -> Result<Pbn> {
        loop {
            let attempt = self.slab_depot.lock().allocate(zone);
            match attempt {
                Ok(pbn) => {
                    self.stats.record_allocation();
                    return Ok(pbn);
                }
                Err(VdoError::OutOfSpace { .. }) => {
                    self.stats.out_of_space_waits.fetch_add(1, Ordering::Relaxed);
                    self.allocation_gate.wait();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_release_hash_lock(&self, fingerprint: Fingerprint) {
        let mut table = self.hash_locks.lock();
        if table.waiter_count(fingerprint) == 0 {
            let _ = table.release(fingerprint);
        }
    }

    fn verify_candidate(&self, candidate_pbn: Pbn, buffer: &[u8; VDO_BLOCK_SIZE]) -> Result<bool> {
        let mut buf = [0u8; VDO_BLOCK_SIZE];
        self.device.read_block(candidate_pbn, &mut buf)?;
        Ok(&buf == buffer)
    }

    // ---- the committed-mapping step: journal + refcounts + block map
    //      + lock-counter acquire/release (spec §4.8 steps 9-12) ----------

    fn commit_mapping(
        &self,
        logical_zone: u32,
        lbn: Lbn,
        old_mapping: BlockMapEntry,
        new_mapping: BlockMapEntry,
        ref_mode: RefMode,
    ) -> Result<()> {
        let slot = loop {
            let attempt = self.recovery_journal.lock().reserve();
            match attempt {
                Ok(slot) => break slot,
                Err(VdoError::OutOfSpace { .. }) => {
                    self.stats.out_of_space_waits.fetch_add(1, Ordering::Relaxed);
                    self.journal_gate.wait();
                }
                Err(e) => return Err(e),
            }
        };

        {
            let mut journal = self.recovery_journal.lock();
            if journal.entries_in(slot.block_index)?.is_empty() {
                self.lock_counter.lock().initialize_lock_count(slot.block_index, 0)?;
            }
            journal.append(slot, JournalEntry { lbn, old_mapping, new_mapping })?;
        }

        let decrement_old = old_mapping.state.is_mapped() && old_mapping.pbn != new_mapping.pbn;
        let new_pz = if new_mapping.pbn.is_zero_block() { None } else { Some(self.physical_zone_of(new_mapping.pbn)?) };
        let old_pz = if decrement_old { Some(self.physical_zone_of(old_mapping.pbn)?) } else { None };

        {
            let mut lc = self.lock_counter.lock();
            lc.acquire_reference(slot.block_index, ZoneType::Journal)?;
            lc.acquire_reference(slot.block_index, ZoneType::Logical(logical_zone))?;
            if let Some(z) = new_pz {
                lc.acquire_reference(slot.block_index, ZoneType::Physical(z))?;
            }
            if let Some(z) = old_pz {
                if Some(z) != new_pz {
                    lc.acquire_reference(slot.block_index, ZoneType::Physical(z))?;
                }
            }
        }

        let refcount_result = self.apply_refcount_deltas(&new_mapping, ref_mode, decrement_old.then_some(old_mapping), slot.sequence_number);
        if let Err(e) = refcount_result {
            if e.is_fatal() {
                self.enter_read_only();
            }
            return Err(e);
        }
        self.allocation_gate.notify_all();

        let put_result = self.block_map.lock().put(lbn, new_mapping);
        if let Err(e) = put_result {
            if e.is_fatal() {
                self.enter_read_only();
            }
            return Err(e);
        }

        {
            let mut lc = self.lock_counter.lock();
            lc.release_reference_owning_thread(slot.block_index, ZoneType::Logical(logical_zone))?;
            if let Some(z) = new_pz {
                lc.release_reference_owning_thread(slot.block_index, ZoneType::Physical(z))?;
            }
            if let Some(z) = old_pz {
                if Some(z) != new_pz {
                    lc.release_reference_owning_thread(slot.block_index, ZoneType::Physical(z))?;
                }
            }
        }

        self.device.flush()?;
        self.recovery_journal.lock().mark_durable(slot.block_index)?;
        self.stats.journal_blocks_written.fetch_add(1, Ordering::Relaxed);

        {
            let mut lc = self.lock_counter.lock();
            lc.release_reference_owning_thread(slot.block_index, ZoneType::Journal)?;
            if lc.is_notifying() {
                lc.acknowledge_unlock();
                self.stats.journal_blocks_reclaimed.fetch_add(1, Ordering::Relaxed);
                self.journal_gate.notify_all();
            }
        }

        self.stats.record_write();
        Ok(())
    }

    fn apply_refcount_deltas(
        &self,
        new_mapping: &BlockMapEntry,
        ref_mode: RefMode,
        old_mapping: Option<BlockMapEntry>,
        sequence_number: u64,
    ) -> Result<()> {
        let mut depot = self.slab_depot.lock();

        if !new_mapping.pbn.is_zero_block() {
            match ref_mode {
                RefMode::None => {}
                RefMode::Increment => {
                    depot.slab_for_pbn_mut(new_mapping.pbn)?.apply_increment(new_mapping.pbn, sequence_number)?;
                }
                RefMode::CommitProvisional => {
                    depot.slab_for_pbn_mut(new_mapping.pbn)?.commit_provisional_allocation(new_mapping.pbn, sequence_number)?;
                }
                RefMode::FirstFragment => {
                    let slab = depot.slab_for_pbn_mut(new_mapping.pbn)?;
                    slab.commit_provisional_allocation(new_mapping.pbn, sequence_number)?;
                    let offset = slab.offset_of(new_mapping.pbn);
                    slab.reference_counts.increment_fragment(offset);
                }
                RefMode::SubsequentFragment => {
                    let slab = depot.slab_for_pbn_mut(new_mapping.pbn)?;
                    slab.apply_increment(new_mapping.pbn, sequence_number)?;
                    let offset = slab.offset_of(new_mapping.pbn);
                    slab.reference_counts.increment_fragment(offset);
                }
            }
            let n = depot.slab_number_for(new_mapping.pbn)?;
            depot.note_free_count_changed(n, self.config.physical_zones);
        }

        if let Some(old) = old_mapping {
            let slab = depot.slab_for_pbn_mut(old.pbn)?;
            if old.state.is_compressed() {
                let offset = slab.offset_of(old.pbn);
                let _drained = slab.reference_counts.decrement_fragment(offset)?;
            }
            slab.apply_decrement(old.pbn, sequence_number)?;
            self.stats.record_free();
            let n = depot.slab_number_for(old.pbn)?;
            depot.note_free_count_changed(n, self.config.physical_zones);
        }

        Ok(())
    }

    // ---- write path (spec §4.8) ----------------------------------------

    /// Write a full 4 KiB block.
    pub fn write_block(&self, lbn: Lbn, data: &[u8; VDO_BLOCK_SIZE]) -> Result<()> {
        self.do_write(lbn, *data, VioOperation::Write)
    }

    /// Write fewer than 4 KiB at `offset` within a block, read-modify-write
    /// style. Per spec §9's partial-write supplement, the unwritten portion
    /// of the buffer is treated as zero rather than read back from the
    /// block's previous contents (so two partial writes that differ only
    /// outside the written range still dedupe identically).
    pub fn write_partial(&self, lbn: Lbn, offset: usize, data: &[u8]) -> Result<()> {
        let mut buf = [0u8; VDO_BLOCK_SIZE];
        buf[offset..offset + data.len()].copy_from_slice(data);
        self.do_write(lbn, buf, VioOperation::ReadModifyWrite)
    }

    fn do_write(&self, lbn: Lbn, data: [u8; VDO_BLOCK_SIZE], operation: VioOperation) -> Result<()> {
        if self.admin.lock().is_read_only() {
            return Err(VdoError::ReadOnly);
        }
        let id = self.pool.acquire_blocking(lbn, operation, Instant::now());
        self.pool.with_vio(id, |vio| vio.buffer.copy_from_slice(&data));
        let result = self.execute_write(id, lbn);
        self.pool.release(id);
        result
    }

    fn execute_write(&self, id: u32, lbn: Lbn) -> Result<()> {
        if !self.admin.lock().accepts_writes() {
            return Err(VdoError::ReadOnly);
        }
        let logical_zone = self.logical_zone_for(lbn);
        self.acquire_logical_lock(logical_zone, lbn, id);
        let result = self.write_body(id, lbn, logical_zone);
        self.release_logical_lock(logical_zone, lbn, id);
        result
    }

    fn write_body(&self, id: u32, lbn: Lbn, logical_zone: u32) -> Result<()> {
        let old_mapping = self.block_map.lock().get(lbn)?;
        let buffer = self.pool.with_vio(id, |vio| *vio.buffer);
        let is_zero_block = buffer.iter().all(|&b| b == 0);

        if is_zero_block {
            return self.commit_mapping(logical_zone, lbn, old_mapping, BlockMapEntry::UNMAPPED, RefMode::None);
        }

        let fingerprint = self.cpu_pool.install(|| self.hasher.hash(&buffer));
        self.pool.with_vio(id, |vio| vio.fingerprint = Some(fingerprint));

        match self.hash_locks.lock().join(fingerprint, id) {
            JoinOutcome::Waiter => {
                // Link against whatever the agent finally committed to: an
                // existing uncompressed block, or one of the packer's
                // compressed slots if the agent's write ended up packed.
                // Never assume `Uncompressed` here (spec §8 property 3).
                let new_mapping = loop {
                    if let Some(mapping) = self.hash_locks.lock().committed_mapping(fingerprint) {
                        break mapping;
                    }
                    self.hash_lock_gate.wait();
                };
                self.stats.record_dedupe_hit();
                let result = self.commit_mapping(logical_zone, lbn, old_mapping, new_mapping, RefMode::Increment);
                self.hash_locks.lock().finish_waiting(fingerprint, id)?;
                self.try_release_hash_lock(fingerprint);
                result
            }
            JoinOutcome::Agent => self.run_as_hash_lock_agent(id, lbn, logical_zone, old_mapping, fingerprint, buffer),
        }
    }

    fn run_as_hash_lock_agent(
        &self,
        id: u32,
        lbn: Lbn,
        logical_zone: u32,
        old_mapping: BlockMapEntry,
        fingerprint: Fingerprint,
        buffer: [u8; VDO_BLOCK_SIZE],
    ) -> Result<()> {
        if let Some(candidate) = self.advisor.query(fingerprint) {
            if candidate.state == MappingState::Uncompressed && self.verify_candidate(candidate.pbn, &buffer)? {
                self.stats.record_dedupe_hit();
                let new_mapping = BlockMapEntry { pbn: candidate.pbn, state: MappingState::Uncompressed };
                self.hash_locks.lock().commit(fingerprint, id, new_mapping)?;
                self.hash_lock_gate.notify_all();
                let result = self.commit_mapping(logical_zone, lbn, old_mapping, new_mapping, RefMode::Increment);
                self.try_release_hash_lock(fingerprint);
                return result;
            }
            self.stats.dedupe_advice_stale.fetch_add(1, Ordering::Relaxed);
        }

        let alloc_zone = self.physical_zone_route(lbn);
        let pbn = self.allocate_blocking(alloc_zone)?;

        // Do not commit the hash lock or post dedupe advice yet: until
        // compression (and possibly the packer) decides on a final mapping,
        // `pbn` is only a provisional single-block claim that may still be
        // cancelled in favor of a shared compressed slot (spec §8 property 3).
        let compressed = self.cpu_pool.install(|| self.compressor.compress(&buffer));
        let result = match compressed {
            Some(bytes) if bytes.len() < VDO_BLOCK_SIZE => {
                self.hand_off_to_packer(id, lbn, logical_zone, old_mapping, pbn, bytes, fingerprint)
            }
            _ => {
                let new_mapping = BlockMapEntry { pbn, state: MappingState::Uncompressed };
                self.hash_locks.lock().commit(fingerprint, id, new_mapping)?;
                self.hash_lock_gate.notify_all();
                self.advisor.post(fingerprint, new_mapping);
                self.commit_mapping(logical_zone, lbn, old_mapping, new_mapping, RefMode::CommitProvisional)
            }
        };
        self.try_release_hash_lock(fingerprint);
        result
    }

    /// The data compressed below block size: release the VIO's own
    /// provisional allocation (it will end up sharing a block allocated by
    /// the packer instead) and queue its compressed bytes (spec §4.8 step 7,
    /// §4.6). Blocks until this fragment's bin has actually been written and
    /// its mapping committed — the caller's bio is acknowledged and this VIO
    /// released only once the pipeline has quiesced (spec §3), never while
    /// the bytes are merely sitting in a bin.
    fn hand_off_to_packer(
        &self,
        id: u32,
        lbn: Lbn,
        logical_zone: u32,
        old_mapping: BlockMapEntry,
        own_pbn: Pbn,
        compressed: Vec<u8>,
        fingerprint: Fingerprint,
    ) -> Result<()> {
        {
            let mut depot = self.slab_depot.lock();
            depot.slab_for_pbn_mut(own_pbn)?.cancel_provisional_allocation(own_pbn)?;
            let n = depot.slab_number_for(own_pbn)?;
            depot.note_free_count_changed(n, self.config.physical_zones);
        }
        self.allocation_gate.notify_all();

        self.fragment_meta.lock().insert(id, FragmentMeta { lbn, logical_zone, old_mapping, fingerprint });
        let fragment = PendingFragment { data_vio_id: id, compressed, may_not_compress: false };
        let joined_at = Instant::now();
        let outcome = self.packer.lock().add_fragment(fragment, joined_at);
        match outcome {
            AddOutcome::Full { fragments, .. } => {
                let result = self.flush_packed_bin(fragments);
                self.fragment_results.lock().remove(&id);
                result
            }
            AddOutcome::Accumulating { .. } => self.wait_for_fragment_flush(id, joined_at),
        }
    }

    /// Park until `id`'s fragment has been flushed by whichever caller fills
    /// or expires its bin. Since nothing else drives the packer's timer in
    /// this crate's blocking-critical-section model (see the module-level
    /// Design Notes), the waiting VIO itself arms the bounded flush-interval
    /// timer: if no one else has filled the bin by the deadline, it forces
    /// the flush itself (spec §5's "packer has a bounded timer", §8
    /// property 7).
    fn wait_for_fragment_flush(&self, id: u32, joined_at: Instant) -> Result<()> {
        loop {
            if let Some(result) = self.fragment_results.lock().remove(&id) {
                return result;
            }
            if joined_at.elapsed() >= self.config.packer_flush_interval {
                let _ = self.expire_packer_bins(Instant::now());
                if let Some(result) = self.fragment_results.lock().remove(&id) {
                    return result;
                }
            }
            self.packer_gate.wait_timeout(self.config.packer_flush_interval);
        }
    }

    /// A bin reached capacity or timed out: allocate the one shared physical
    /// block it needs and drive every participating fragment's hash-lock
    /// commit and mapping commit to completion (spec §4.6, §4.8 step 8).
    /// Runs on whichever caller's write happened to fill or expire the bin;
    /// every other participant is parked in [`VdoInstance::wait_for_fragment_flush`]
    /// and is woken once its own entry lands in `fragment_results`.
    fn flush_packed_bin(&self, fragments: Vec<PendingFragment>) -> Result<()> {
        let metas: Vec<FragmentMeta> = fragments
            .iter()
            .map(|f| {
                self.fragment_meta
                    .lock()
                    .remove(&f.data_vio_id)
                    .ok_or_else(|| VdoError::assertion("missing fragment metadata for packed vio"))
            })
            .collect::<Result<_>>()?;

        let result = self.flush_packed_bin_inner(&fragments, &metas);
        if let Err(e) = &result {
            // Allocation or the shared block's write itself failed before any
            // per-fragment result could be recorded: every waiting caller
            // needs to wake with an error rather than block forever.
            let mut results = self.fragment_results.lock();
            for f in &fragments {
                results.entry(f.data_vio_id).or_insert_with(|| Err(e.clone()));
            }
        }
        self.packer_gate.notify_all();
        result
    }

    fn flush_packed_bin_inner(&self, fragments: &[PendingFragment], metas: &[FragmentMeta]) -> Result<()> {
        let alloc_zone = self.physical_zone_route(metas[0].lbn);
        let pbn = self.allocate_blocking(alloc_zone)?;

        let raw: Vec<Vec<u8>> = fragments.iter().map(|f| f.compressed.clone()).collect();
        let block = packed_block::build_packed_block(&raw, pbn)?;
        self.device.write_block(pbn, &block)?;
        self.stats.compressed_blocks_written.fetch_add(1, Ordering::Relaxed);
        self.stats.compression_fragments_packed.fetch_add(fragments.len() as u64, Ordering::Relaxed);

        let mut overall = Ok(());
        for (i, meta) in metas.iter().enumerate() {
            let ref_mode = if i == 0 { RefMode::FirstFragment } else { RefMode::SubsequentFragment };
            let new_mapping = BlockMapEntry { pbn, state: MappingState::Compressed(i as u8) };
            let data_vio_id = fragments[i].data_vio_id;

            let committed = self.hash_locks.lock().commit(meta.fingerprint, data_vio_id, new_mapping);
            let result = match committed {
                Ok(()) => {
                    self.hash_lock_gate.notify_all();
                    self.advisor.post(meta.fingerprint, new_mapping);
                    self.commit_mapping(meta.logical_zone, meta.lbn, meta.old_mapping, new_mapping, ref_mode)
                }
                Err(e) => Err(e),
            };
            self.try_release_hash_lock(meta.fingerprint);

            self.fragment_results.lock().insert(data_vio_id, result.clone());
            if result.is_err() && overall.is_ok() {
                overall = result;
            }
        }
        overall
    }

    /// Force-flush any packer bin that has been open longer than the
    /// configured flush interval, even if it never filled (spec §4.6, §5).
    /// Called internally by [`VdoInstance::wait_for_fragment_flush`] once a
    /// blocked write's own deadline passes; also exposed here so tests and
    /// embedders can drive it explicitly with a fixed clock.
    pub fn expire_packer_bins(&self, now: Instant) -> Result<()> {
        let expired = self.packer.lock().expire_timed_out_bins(now);
        for (_, fragments) in expired {
            self.flush_packed_bin(fragments)?;
        }
        Ok(())
    }

    // ---- read path (spec §4.8) -----------------------------------------

    pub fn read_block(&self, lbn: Lbn) -> Result<[u8; VDO_BLOCK_SIZE]> {
        let entry = self.block_map.lock().get(lbn)?;
        let result = match entry.state {
            MappingState::Unmapped => Ok([0u8; VDO_BLOCK_SIZE]),
            MappingState::Uncompressed => {
                let mut buf = [0u8; VDO_BLOCK_SIZE];
                self.device.read_block(entry.pbn, &mut buf)?;
                Ok(buf)
            }
            MappingState::Compressed(slot) => {
                let mut raw = [0u8; VDO_BLOCK_SIZE];
                self.device.read_block(entry.pbn, &mut raw)?;
                let fragment = packed_block::extract_fragment(&raw, slot, entry.pbn)?;
                let decompressed = self.compressor.decompress(&fragment, VDO_BLOCK_SIZE)?;
                let mut out = [0u8; VDO_BLOCK_SIZE];
                out.copy_from_slice(&decompressed);
                Ok(out)
            }
        };
        if result.is_ok() {
            self.stats.record_read();
        }
        result
    }

    // ---- discard path (spec §4.8) --------------------------------------

    /// Discard (unmap) a single block, decrementing any prior mapping's
    /// reference.
    pub fn discard_block(&self, lbn: Lbn) -> Result<()> {
        if self.admin.lock().is_read_only() {
            return Err(VdoError::ReadOnly);
        }
        let id = self.pool.acquire_blocking(lbn, VioOperation::Trim, Instant::now());
        let logical_zone = self.logical_zone_for(lbn);
        self.acquire_logical_lock(logical_zone, lbn, id);
        let result = (|| {
            let old_mapping = self.block_map.lock().get(lbn)?;
            if !old_mapping.state.is_mapped() {
                return Ok(());
            }
            self.commit_mapping(logical_zone, lbn, old_mapping, BlockMapEntry::UNMAPPED, RefMode::None)
        })();
        self.release_logical_lock(logical_zone, lbn, id);
        self.pool.release(id);
        result
    }

    /// Discard a run of `block_count` consecutive LBNs starting at
    /// `start_lbn` (spec §4.8's "discard crossing block boundaries").
    pub fn discard_range(&self, start_lbn: Lbn, block_count: u64) -> Result<()> {
        for i in 0..block_count {
            let lbn = Lbn::new(start_lbn.as_u64() + i)?;
            self.discard_block(lbn)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{Lz4Compressor, MemoryBlockDevice, MemoryDedupeAdvisor, Murmur3Hasher};

    /// Deterministic xorshift64 fill: high enough entropy that LZ4 can't
    /// shrink it, so writes using this helper take the uncompressed path.
    fn pseudo_random_block(seed: u64) -> [u8; VDO_BLOCK_SIZE] {
        let mut state = seed.wrapping_add(0x9E3779B97F4A7C15);
        let mut out = [0u8; VDO_BLOCK_SIZE];
        for byte in out.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *byte = (state & 0xFF) as u8;
        }
        out
    }

    fn instance(physical_blocks: u64) -> VdoInstance {
        let config = VdoConfig {
            physical_blocks,
            slab_blocks: 8,
            logical_zones: 2,
            physical_zones: 2,
            recovery_journal_blocks: 8,
            recovery_journal_entries_per_block: 16,
            packer_bins_full_threshold: 4,
            packer_flush_interval: std::time::Duration::from_millis(50),
            max_in_flight_vios: 64,
            max_in_flight_discards: 16,
            cpu_workers: 1,
        };
        let device = Arc::new(MemoryBlockDevice::new(1 + physical_blocks));
        let advisor = Arc::new(MemoryDedupeAdvisor::new());
        let compressor = Arc::new(Lz4Compressor);
        let hasher = Arc::new(Murmur3Hasher);
        let instance = VdoInstance::new(config, device, advisor, compressor, hasher).unwrap();
        instance.load(LoadStrategy::Normal).unwrap();
        instance
    }

    #[test]
    fn zero_block_write_unmaps_without_allocating() {
        let vdo = instance(32);
        let lbn = Lbn::new(5).unwrap();
        vdo.write_block(lbn, &[0u8; VDO_BLOCK_SIZE]).unwrap();
        let entry = vdo.block_map.lock().get(lbn).unwrap();
        assert_eq!(entry, BlockMapEntry::UNMAPPED);
        assert_eq!(vdo.statistics().blocks_allocated, 0);
        let read_back = vdo.read_block(lbn).unwrap();
        assert!(read_back.iter().all(|&b| b == 0));
    }

    #[test]
    fn unique_write_allocates_and_reads_back() {
        let vdo = instance(32);
        let lbn = Lbn::new(1).unwrap();
        let data = pseudo_random_block(1);
        vdo.write_block(lbn, &data).unwrap();
        assert_eq!(vdo.statistics().blocks_allocated, 1);
        assert_eq!(vdo.read_block(lbn).unwrap(), data);
    }

    #[test]
    fn duplicate_write_dedupes_to_the_same_pbn() {
        let vdo = instance(32);
        let data = pseudo_random_block(2);
        vdo.write_block(Lbn::new(1).unwrap(), &data).unwrap();
        vdo.write_block(Lbn::new(2).unwrap(), &data).unwrap();

        let e1 = vdo.block_map.lock().get(Lbn::new(1).unwrap()).unwrap();
        let e2 = vdo.block_map.lock().get(Lbn::new(2).unwrap()).unwrap();
        assert_eq!(e1.pbn, e2.pbn);
        assert_eq!(vdo.statistics().dedupe_hits, 1);
        assert_eq!(vdo.statistics().blocks_allocated, 1);
    }

    #[test]
    fn overwrite_releases_the_old_mapping() {
        let vdo = instance(32);
        let lbn = Lbn::new(9).unwrap();
        let a = pseudo_random_block(3);
        let b = pseudo_random_block(4);
        vdo.write_block(lbn, &a).unwrap();
        let first_pbn = vdo.block_map.lock().get(lbn).unwrap().pbn;
        vdo.write_block(lbn, &b).unwrap();
        let second_pbn = vdo.block_map.lock().get(lbn).unwrap().pbn;
        assert_ne!(first_pbn, second_pbn);

        let depot = vdo.slab_depot.lock();
        let slab = depot.slab_for_pbn(first_pbn).unwrap();
        let offset = slab.offset_of(first_pbn);
        assert_eq!(slab.reference_counts.raw_count(offset).unwrap(), 0);
    }

    #[test]
    fn highly_compressible_writes_pack_into_one_shared_block() {
        // A write whose bytes land in the packer blocks until its bin is
        // flushed (spec §3), so filling a 4-fragment bin needs 4 concurrent
        // writers rather than 4 sequential calls from one thread.
        let vdo = instance(64);
        std::thread::scope(|scope| {
            for i in 0..4u64 {
                let vdo = &vdo;
                scope.spawn(move || {
                    let mut data = [0xAAu8; VDO_BLOCK_SIZE];
                    data[0] = i as u8; // keeps fingerprints distinct, still trivially compressible
                    vdo.write_block(Lbn::new(100 + i).unwrap(), &data).unwrap();
                });
            }
        });

        let entries: Vec<_> =
            (0..4u64).map(|i| vdo.block_map.lock().get(Lbn::new(100 + i).unwrap()).unwrap()).collect();
        let shared_pbn = entries[0].pbn;
        let mut slots: Vec<u8> = Vec::new();
        for entry in &entries {
            assert_eq!(entry.pbn, shared_pbn);
            match entry.state {
                MappingState::Compressed(slot) => slots.push(slot),
                other => panic!("expected a compressed slot, got {other:?}"),
            }
        }
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert_eq!(vdo.statistics().compressed_blocks_written, 1);

        for i in 0..4u64 {
            let mut expected = [0xAAu8; VDO_BLOCK_SIZE];
            expected[0] = i as u8;
            assert_eq!(vdo.read_block(Lbn::new(100 + i).unwrap()).unwrap(), expected);
        }
    }

    #[test]
    fn discard_unmaps_and_frees_the_block() {
        let vdo = instance(32);
        let lbn = Lbn::new(3).unwrap();
        let data = pseudo_random_block(9);
        vdo.write_block(lbn, &data).unwrap();
        let pbn = vdo.block_map.lock().get(lbn).unwrap().pbn;
        vdo.discard_block(lbn).unwrap();
        assert_eq!(vdo.block_map.lock().get(lbn).unwrap(), BlockMapEntry::UNMAPPED);
        let depot = vdo.slab_depot.lock();
        let slab = depot.slab_for_pbn(pbn).unwrap();
        assert_eq!(slab.reference_counts.raw_count(slab.offset_of(pbn)).unwrap(), 0);
    }

    #[test]
    fn partial_write_zero_fills_then_reads_back_exactly() {
        let vdo = instance(32);
        let lbn = Lbn::new(11).unwrap();
        // The zero-filled RMW buffer is trivially compressible and alone in
        // its bin; nothing else will join it, so `write_partial` blocks for
        // up to `packer_flush_interval` while it self-expires its own bin
        // before returning (spec §3, §5's bounded packer timer).
        vdo.write_partial(lbn, 10, &[1, 2, 3]).unwrap();
        let mut expected = [0u8; VDO_BLOCK_SIZE];
        expected[10..13].copy_from_slice(&[1, 2, 3]);
        assert_eq!(vdo.read_block(lbn).unwrap(), expected);
    }

    #[test]
    fn growing_the_depot_adds_usable_capacity() {
        // 16 physical blocks / 8 per slab / 2 zones = one slab per zone,
        // evenly dividing capacity so every routed write lands on a slab
        // that actually exists.
        let vdo = instance(16);
        for i in 0..16u64 {
            vdo.write_block(Lbn::new(i).unwrap(), &pseudo_random_block(100 + i)).unwrap();
        }
        assert!(matches!(
            vdo.write_block(Lbn::new(99).unwrap(), &pseudo_random_block(200)),
            Err(VdoError::OutOfSpace { .. })
        ));

        vdo.prepare_to_grow(32).unwrap();
        vdo.use_new_slabs().unwrap();

        // Now there is room again.
        vdo.write_block(Lbn::new(99).unwrap(), &pseudo_random_block(200)).unwrap();
        assert_eq!(vdo.statistics().blocks_allocated, 17);
    }

    #[test]
    fn prepare_to_grow_without_use_can_be_abandoned() {
        let vdo = instance(16);
        vdo.prepare_to_grow(32).unwrap();
        vdo.abandon_new_slabs();
        assert!(matches!(vdo.use_new_slabs(), Err(VdoError::InvalidAdminState { .. })));
    }

    #[test]
    fn writes_are_rejected_once_read_only() {
        let vdo = instance(32);
        vdo.enter_read_only();
        let data = [0x11u8; VDO_BLOCK_SIZE];
        assert!(matches!(vdo.write_block(Lbn::new(1).unwrap(), &data), Err(VdoError::ReadOnly)));
    }
}
