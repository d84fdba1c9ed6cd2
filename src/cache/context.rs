//! 缓存上下文与锁规则
//!
//! [`CacheContext`] 持有唯一的上下文互斥锁，锁内是缓存项数组、扇区索引、
//! 驱逐列表、驱动表和统计信息。
//!
//! # 锁规则
//!
//! - [`ContextGuard`] 是作用域锁：构造时加锁，drop 时解锁。内部调用路径通过
//!   传递 `&mut ContextGuard` 实现重入，嵌套深度由 [`ContextGuard::nested`] 记录。
//! - [`ContextGuard::unlocked`] 在设备 I/O 期间*完全*释放锁，结束后恢复到同样的深度；
//!   有界等待也一样完全释放锁。
//! - 设备 I/O 总是在不持有锁的情况下执行。

use super::config::CacheConfig;
use super::entry::{CacheEntry, EntryId, EntryWait};
use super::index::SectorIndex;
use super::lru::EvictionList;
use super::stats::CacheStats;
use super::storage::SectorStorage;
use crate::consts::MAX_ARENA_ENTRIES;
use crate::drive::{DriveGeometry, DriveTag, MediaDrive};
use crate::error::{Error, ErrorKind, Result};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// 已注册的驱动
#[derive(Clone)]
pub(crate) struct DriveSlot {
    pub tag: DriveTag,
    pub drive: Arc<dyn MediaDrive>,
    pub geometry: DriveGeometry,
}

/// 缓存项数组以及索引、驱逐列表
pub(crate) struct Arena {
    pub entries: Vec<CacheEntry>,
    pub index: SectorIndex,
    pub lru: EvictionList,
    pub storage: Arc<SectorStorage>,
}

impl Arena {
    /// 由调用者提供的缓冲区构建
    ///
    /// 缓存项数 = 缓冲区长度 / `max_sector_size`，全部以无效状态放入驱逐列表，
    /// 按数组顺序从冷端排起。
    pub fn new(buffer: Vec<u8>, config: &CacheConfig) -> Result<Self> {
        let entry_size = config.max_sector_size;
        if entry_size == 0 || buffer.len() < entry_size {
            return Err(Error::new(
                ErrorKind::InvalidBuffer,
                "backing buffer too small for one cache entry",
            ));
        }
        if buffer.as_ptr() as usize % core::mem::align_of::<u32>() != 0 {
            return Err(Error::new(ErrorKind::InvalidBuffer, "backing buffer is misaligned"));
        }

        let mut count = buffer.len() / entry_size;
        if count > MAX_ARENA_ENTRIES {
            log::warn!(
                "[CACHE] backing buffer holds {} entries, only {} are addressable",
                count,
                MAX_ARENA_ENTRIES
            );
            count = MAX_ARENA_ENTRIES;
        }

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(count)
            .map_err(|_| Error::new(ErrorKind::OutOfMemory, "cannot allocate cache entries"))?;
        entries.extend((0..count).map(|id| CacheEntry::new(id as EntryId)));

        // 无效项插入冷端，逆序插入使 0 号项最冷
        let mut lru = EvictionList::new(config.lru_window);
        for entry in entries.iter().rev() {
            lru.insert(entry);
        }

        Ok(Self {
            entries,
            index: SectorIndex::new(),
            lru,
            storage: Arc::new(SectorStorage::new(buffer, entry_size, count)),
        })
    }

    /// 缓存项数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 每个缓存项的缓冲区大小
    pub fn entry_size(&self) -> usize {
        self.storage.entry_size()
    }

    /// 缓存项
    pub fn entry(&self, id: EntryId) -> &CacheEntry {
        &self.entries[id as usize]
    }

    /// 缓存项（可变）
    pub fn entry_mut(&mut self, id: EntryId) -> &mut CacheEntry {
        &mut self.entries[id as usize]
    }

    /// 持有缓存项；原来无人持有时先从驱逐列表移除
    pub fn claim(&mut self, id: EntryId) {
        let entry = &self.entries[id as usize];
        if entry.refcount() == 0 {
            self.lru.remove(id);
        }
        entry.retain();
    }

    /// 释放一次持有；变为无人持有时插回驱逐列表
    pub fn release_entry(&mut self, id: EntryId) -> u32 {
        let entry = &self.entries[id as usize];
        match entry.release() {
            Some(0) => {
                self.lru.insert(entry);
                0
            }
            Some(n) => n,
            None => {
                debug_assert!(false, "refcount underflow on entry {}", id);
                0
            }
        }
    }

    /// 从索引移除、复位并放到冷端
    ///
    /// 调用者必须是唯一持有者，它的持有随复位一起清除。
    pub fn invalidate(&mut self, id: EntryId) {
        let entry = &mut self.entries[id as usize];
        debug_assert!(entry.refcount() <= 1, "invalidating a shared entry");
        if entry.is_valid() {
            self.index.remove(entry);
        }
        entry.reset();
        self.lru.insert(entry);
    }

    /// 检查全部不变量
    pub fn check(&self) -> core::result::Result<(), &'static str> {
        let mut keys = BTreeSet::new();
        for entry in &self.entries {
            let unowned = entry.refcount() == 0;
            if self.lru.contains(entry.id()) != unowned {
                return Err("eviction list membership does not match refcount");
            }
            if entry.is_write_pending() && unowned {
                return Err("write pending on an unowned entry");
            }
            if entry.is_write_through() && !entry.is_write_pending() {
                return Err("write-through without a pending write");
            }
            if entry.is_valid() {
                let indexed = self.index.lookup(entry.drive, entry.sector) == Some(entry.id());
                if !indexed && !self.index.is_reserved(entry.drive, entry.sector) {
                    return Err("valid entry missing from index");
                }
                if !keys.insert(SectorIndex::key(entry.drive, entry.sector)) {
                    return Err("two valid entries for one sector");
                }
            }
        }
        for (drive, sector, id) in self.index.iter() {
            if !self.entries[id as usize].holds(drive, sector) {
                return Err("index entry does not match its key");
            }
        }
        Ok(())
    }
}

/// 锁保护的缓存状态
pub(crate) struct CacheState {
    pub arena: Option<Arena>,
    pub drives: BTreeMap<DriveTag, DriveSlot>,
    pub stats: CacheStats,
    pub closing: bool,
}

/// 缓存上下文
pub(crate) struct CacheContext {
    config: CacheConfig,
    state: Mutex<CacheState>,
    changed: Condvar,
}

impl CacheContext {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                arena: None,
                drives: BTreeMap::new(),
                stats: CacheStats::default(),
                closing: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 加锁
    pub fn lock(&self) -> ContextGuard<'_> {
        ContextGuard {
            ctx: self,
            guard: self.state.lock(),
            depth: 1,
        }
    }
}

/// 作用域上下文锁
pub(crate) struct ContextGuard<'a> {
    ctx: &'a CacheContext,
    guard: MutexGuard<'a, CacheState>,
    depth: usize,
}

impl Deref for ContextGuard<'_> {
    type Target = CacheState;

    fn deref(&self) -> &CacheState {
        &self.guard
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut CacheState {
        &mut self.guard
    }
}

impl<'a> ContextGuard<'a> {
    pub fn config(&self) -> &'a CacheConfig {
        &self.ctx.config
    }

    /// 当前嵌套深度
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// 在已持有锁的情况下重入
    pub fn nested<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// 已初始化的缓存项数组
    pub fn arena(&self) -> Result<&Arena> {
        self.guard
            .arena
            .as_ref()
            .ok_or(Error::new(ErrorKind::InvalidState, "media cache not initialized"))
    }

    /// 已初始化的缓存项数组（可变）
    pub fn arena_mut(&mut self) -> Result<&mut Arena> {
        self.guard
            .arena
            .as_mut()
            .ok_or(Error::new(ErrorKind::InvalidState, "media cache not initialized"))
    }

    /// 按标签查找驱动
    pub fn drive(&self, tag: DriveTag) -> Result<DriveSlot> {
        self.guard
            .drives
            .get(&tag)
            .cloned()
            .ok_or(Error::new(ErrorKind::InvalidDriveTag, "unknown drive tag"))
    }

    /// 完全释放锁执行 `f`，之后恢复到同样的嵌套深度
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let depth = self.depth;
        log::trace!("[CACHE] suspend context lock at depth {}", depth);
        let result = MutexGuard::unlocked(&mut self.guard, f);
        self.depth = depth;
        result
    }

    /// 唤醒所有等待者
    pub fn notify(&self) {
        self.ctx.changed.notify_all();
    }

    /// 本次等待的截止时间
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.ctx.config.wait_timeout
    }

    /// 释放锁等待一次状态变化（最多一个 tick）
    ///
    /// 已过截止时间时返回 `Timeout`。
    pub fn wait_for_change(&mut self, deadline: Instant) -> Result<()> {
        let now = Instant::now();
        if now >= deadline {
            self.guard.stats.timeouts += 1;
            log::warn!("[CACHE] wait timed out at depth {}", self.depth);
            return Err(Error::new(ErrorKind::Timeout, "cache wait timed out"));
        }
        let until = deadline.min(now + self.ctx.config.tick);
        let depth = self.depth;
        self.ctx.changed.wait_until(&mut self.guard, until);
        self.depth = depth;
        Ok(())
    }

    /// 等待缓存项满足条件
    pub fn wait_entry(&mut self, id: EntryId, cond: EntryWait, deadline: Instant) -> Result<()> {
        loop {
            if cond.satisfied(self.arena()?.entry(id)) {
                return Ok(());
            }
            self.wait_for_change(deadline)?;
        }
    }

    /// 释放一组缓存项的持有并唤醒等待者
    pub fn release_entries(&mut self, ids: impl IntoIterator<Item = EntryId>) {
        if let Some(arena) = self.guard.arena.as_mut() {
            for id in ids {
                arena.release_entry(id);
            }
        }
        self.notify();
    }

    /// 释放锁休眠一个 tick
    pub fn sleep_tick(&mut self) {
        let tick = self.ctx.config.tick;
        self.ctx.changed.wait_for(&mut self.guard, tick);
    }

    /// 从介质载入连续扇区，`ids[0]` 的扇区号为起点
    ///
    /// 调用者必须独占 `ids` 中的全部缓存项。
    pub fn load_entries(&mut self, slot: &DriveSlot, ids: &[EntryId]) -> Result<()> {
        let (storage, start) = {
            let arena = self.arena()?;
            (arena.storage.clone(), arena.entry(ids[0]).sector)
        };
        let size = slot.geometry.native_sector_size as usize;
        let drive = slot.drive.clone();

        // SAFETY: 调用者独占这些缓存项，锁释放期间没有其他访问者
        let result = self.unlocked(|| unsafe { storage.load_run(drive.as_ref(), start, ids, size) });
        match &result {
            Ok(()) => self.guard.stats.device_reads += ids.len() as u64,
            Err(err) => log::warn!(
                "[CACHE] load {}:{} x{} failed: {}",
                slot.tag,
                start,
                ids.len(),
                err
            ),
        }
        result
    }

    /// 把连续扇区写回介质，`ids[0]` 的扇区号为起点
    ///
    /// 调用者必须持有 `ids` 中的全部缓存项且没有活动的写者。
    pub fn store_entries(&mut self, slot: &DriveSlot, ids: &[EntryId]) -> Result<()> {
        let (storage, start) = {
            let arena = self.arena()?;
            (arena.storage.clone(), arena.entry(ids[0]).sector)
        };
        let size = slot.geometry.native_sector_size as usize;
        let drive = slot.drive.clone();

        // SAFETY: 调用者持有这些缓存项，期间没有写者
        let result = self.unlocked(|| unsafe { storage.store_run(drive.as_ref(), start, ids, size) });
        match &result {
            Ok(()) => self.guard.stats.device_writes += ids.len() as u64,
            Err(err) => log::warn!(
                "[CACHE] store {}:{} x{} failed: {}",
                slot.tag,
                start,
                ids.len(),
                err
            ),
        }
        result
    }

    /// 清零缓存项缓冲区
    ///
    /// 调用者必须独占 `ids` 中的全部缓存项。
    pub fn zero_entries(&mut self, size: usize, ids: &[EntryId]) -> Result<()> {
        let arena = self.arena()?;
        for &id in ids {
            // SAFETY: 调用者独占该缓存项
            unsafe { arena.storage.zero(id, size) };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::RamDrive;
    use core::time::Duration;

    fn config() -> CacheConfig {
        CacheConfig::default().with_wait_timeout(Duration::from_millis(30))
    }

    fn context_with_arena(entries: usize) -> CacheContext {
        let ctx = CacheContext::new(config());
        ctx.lock().arena = Some(Arena::new(alloc::vec![0u8; entries * 512], ctx.config()).unwrap());
        ctx
    }

    #[test]
    fn test_arena_rejects_small_buffer() {
        let err = Arena::new(alloc::vec![0u8; 100], &config()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidBuffer);
    }

    #[test]
    fn test_arena_starts_with_invalid_entries_on_lru() {
        let arena = Arena::new(alloc::vec![0u8; 4 * 512 + 100], &config()).unwrap();
        assert_eq!(arena.len(), 4);
        assert_eq!(arena.lru.len(), 4);
        assert!(arena.index.is_empty());
        arena.check().unwrap();
    }

    #[test]
    fn test_claim_and_release_track_lru_membership() {
        let mut arena = Arena::new(alloc::vec![0u8; 2 * 512], &config()).unwrap();

        arena.claim(0);
        assert!(!arena.lru.contains(0));
        arena.claim(0);
        assert_eq!(arena.release_entry(0), 1);
        assert!(!arena.lru.contains(0));
        assert_eq!(arena.release_entry(0), 0);
        assert!(arena.lru.contains(0));
        arena.check().unwrap();
    }

    #[test]
    fn test_invalidate_moves_to_cold_end() {
        let mut arena = Arena::new(alloc::vec![0u8; 3 * 512], &config()).unwrap();
        arena.claim(2);
        let entry = arena.entry_mut(2);
        entry.assign(DriveTag(0), 7);
        entry.mark_valid();
        let entry = &arena.entries[2];
        arena.index.insert(entry);

        arena.invalidate(2);
        assert_eq!(arena.lru.order()[0], 2);
        assert!(arena.index.lookup(DriveTag(0), 7).is_none());
        arena.check().unwrap();
    }

    #[test]
    fn test_check_detects_lru_mismatch() {
        let mut arena = Arena::new(alloc::vec![0u8; 512], &config()).unwrap();
        arena.lru.remove(0);
        assert!(arena.check().is_err());
    }

    #[test]
    fn test_nested_depth_survives_unlock() {
        let ctx = CacheContext::new(config());
        let mut guard = ctx.lock();
        assert_eq!(guard.depth(), 1);

        guard.nested(|g| {
            assert_eq!(g.depth(), 2);
            let value = g.unlocked(|| {
                // 锁已完全释放，其他加锁者不会阻塞
                let other = ctx.state.try_lock();
                other.is_some()
            });
            assert!(value);
            assert_eq!(g.depth(), 2);
        });
        assert_eq!(guard.depth(), 1);
    }

    #[test]
    fn test_wait_entry_times_out() {
        let ctx = context_with_arena(1);
        let mut guard = ctx.lock();
        {
            let arena = guard.arena_mut().unwrap();
            arena.claim(0);
        }

        let deadline = guard.deadline();
        let err = guard.wait_entry(0, EntryWait::RefcountAtMost(0), deadline).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(guard.stats.timeouts, 1);
    }

    #[test]
    fn test_wait_entry_wakes_on_release() {
        let ctx = Arc::new(CacheContext::new(CacheConfig::default()));
        ctx.lock().arena = Some(Arena::new(alloc::vec![0u8; 512], ctx.config()).unwrap());
        ctx.lock().arena_mut().unwrap().claim(0);

        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                let mut guard = ctx.lock();
                let deadline = guard.deadline();
                guard.wait_entry(0, EntryWait::RefcountAtMost(0), deadline)
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        {
            let mut guard = ctx.lock();
            guard.arena_mut().unwrap().release_entry(0);
            guard.notify();
        }
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_drive_lookup() {
        let ctx = CacheContext::new(config());
        let mut guard = ctx.lock();
        assert_eq!(guard.drive(DriveTag(3)).err().unwrap().kind(), ErrorKind::InvalidDriveTag);

        let drive = Arc::new(RamDrive::new(512, 8));
        let geometry = DriveGeometry::probe(&*drive, 512).unwrap();
        guard.drives.insert(DriveTag(3), DriveSlot { tag: DriveTag(3), drive, geometry });
        assert_eq!(guard.drive(DriveTag(3)).unwrap().geometry.total_native_sectors, 8);
    }

    #[test]
    fn test_uninitialized_arena_is_invalid_state() {
        let ctx = CacheContext::new(config());
        let guard = ctx.lock();
        assert_eq!(guard.arena().err().unwrap().kind(), ErrorKind::InvalidState);
    }
}
