//! 刷新
//!
//! 三种范围：单个扇区、单个驱动（扫描该驱动的全部缓存项）、所有驱动
//! （之后再让每个驱动执行自身的 flush）。每个缓存项写回后可以顺带失效：
//! 从索引移除、复位、插入驱逐列表冷端。

use super::context::{ContextGuard, DriveSlot};
use super::entry::EntryWait;
use super::request::RequestFlags;
use crate::error::Result;
use alloc::vec::Vec;

/// 单个缓存项的刷新方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FlushMode {
    /// 写回后失效
    pub invalidate: bool,
    /// 不写回直接失效
    pub discard: bool,
}

impl FlushMode {
    /// 只写回
    pub const WRITE_BACK: Self = Self { invalidate: false, discard: false };
    /// 写回并失效
    pub const INVALIDATE: Self = Self { invalidate: true, discard: false };
    /// 丢弃
    pub const DISCARD: Self = Self { invalidate: true, discard: true };

    pub fn from_flags(flags: RequestFlags) -> Self {
        if flags.contains(RequestFlags::REMOVE_ENTRY) {
            Self::DISCARD
        } else if flags.contains(RequestFlags::INVALIDATE) {
            Self::INVALIDATE
        } else {
            Self::WRITE_BACK
        }
    }

    /// 是否需要成为唯一持有者
    fn exclusive(&self) -> bool {
        self.invalidate || self.discard
    }
}

/// 刷新一个原生扇区，返回是否写回了数据
///
/// 失效模式下先等到缓存项无人持有再取得它，写回之后再等其他读者释放，
/// 所以不会复位一个仍被令牌持有的缓存项。
pub(crate) fn flush_sector(
    g: &mut ContextGuard<'_>,
    slot: &DriveSlot,
    sector: u32,
    mode: FlushMode,
) -> Result<bool> {
    let tag = slot.tag;
    let deadline = g.deadline();

    let id = loop {
        let arena = g.arena_mut()?;
        match arena.index.lookup(tag, sector) {
            Some(id) if mode.exclusive() => {
                if arena.entry(id).refcount() == 0 {
                    arena.claim(id);
                    break id;
                }
            }
            Some(id) => {
                arena.claim(id);
                if let Err(err) = g.wait_entry(id, EntryWait::WriteComplete, deadline) {
                    g.release_entries([id]);
                    return Err(err);
                }
                break id;
            }
            None if arena.index.is_reserved(tag, sector) => {}
            None => return Ok(false),
        }
        g.wait_for_change(deadline)?;
    };

    let mut written = false;
    if !mode.discard && g.arena()?.entry(id).is_dirty() {
        if let Err(err) = g.store_entries(slot, &[id]) {
            g.release_entries([id]);
            return Err(err);
        }
        g.arena_mut()?.entry_mut(id).mark_clean();
        g.stats.flushes += 1;
        written = true;
    }

    if mode.exclusive() {
        // 写回期间可能有读者预先持有
        if let Err(err) = g.wait_entry(id, EntryWait::RefcountAtMost(1), deadline) {
            g.release_entries([id]);
            return Err(err);
        }
        g.arena_mut()?.invalidate(id);
        g.notify();
        log::debug!("[CACHE] invalidated {}:{} (written {})", tag, sector, written);
    } else {
        g.release_entries([id]);
    }
    Ok(written)
}

/// 刷新一个驱动的全部缓存项，返回写回的数量
pub(crate) fn flush_drive(g: &mut ContextGuard<'_>, slot: &DriveSlot, mode: FlushMode) -> Result<usize> {
    let sectors: Vec<u32> = {
        let arena = g.arena()?;
        arena
            .index
            .sectors_of(slot.tag)
            .filter(|(_, id)| mode.exclusive() || arena.entry(*id).is_dirty())
            .map(|(sector, _)| sector)
            .collect()
    };

    let mut written = 0;
    for sector in sectors {
        if flush_sector(g, slot, sector, mode)? {
            written += 1;
        }
    }
    log::debug!("[CACHE] flushed {}: {} entries written", slot.tag, written);
    Ok(written)
}

/// 刷新所有已注册驱动，然后逐个调用驱动的 flush
pub(crate) fn flush_all(g: &mut ContextGuard<'_>, mode: FlushMode) -> Result<usize> {
    let slots: Vec<DriveSlot> = g.drives.values().cloned().collect();

    let mut written = 0;
    for slot in &slots {
        written += flush_drive(g, slot, mode)?;
    }
    for slot in &slots {
        let drive = slot.drive.clone();
        g.unlocked(|| drive.flush())?;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::context::{Arena, CacheContext};
    use crate::cache::miss::resolve_miss;
    use crate::drive::{DriveGeometry, DriveTag, MediaDrive, RamDrive};
    use crate::error::ErrorKind;
    use alloc::sync::Arc;
    use alloc::vec;
    use core::time::Duration;

    fn setup(entries: usize) -> (CacheContext, Arc<RamDrive>, DriveSlot) {
        let ctx = CacheContext::new(CacheConfig::default().with_wait_timeout(Duration::from_millis(30)));
        let drive = Arc::new(RamDrive::new(512, 16));
        let geometry = DriveGeometry::probe(&*drive, 512).unwrap();
        let slot = DriveSlot {
            tag: DriveTag(0),
            drive: drive.clone() as Arc<dyn MediaDrive>,
            geometry,
        };
        {
            let mut g = ctx.lock();
            g.arena = Some(Arena::new(vec![0u8; entries * 512], ctx.config()).unwrap());
            g.drives.insert(DriveTag(0), slot.clone());
        }
        (ctx, drive, slot)
    }

    fn dirty(g: &mut ContextGuard<'_>, slot: &DriveSlot, sector: u32) -> u16 {
        let id = resolve_miss(g, slot, sector, false).unwrap();
        let arena = g.arena_mut().unwrap();
        unsafe {
            let offset = arena.storage.entry_offset(id);
            arena.storage.bytes_mut(offset, 512).fill(sector as u8 + 0x10);
        }
        arena.entry_mut(id).mark_dirty();
        arena.release_entry(id);
        id
    }

    #[test]
    fn test_flush_mode_from_flags() {
        assert_eq!(FlushMode::from_flags(RequestFlags::empty()), FlushMode::WRITE_BACK);
        assert_eq!(FlushMode::from_flags(RequestFlags::INVALIDATE), FlushMode::INVALIDATE);
        assert_eq!(
            FlushMode::from_flags(RequestFlags::INVALIDATE | RequestFlags::REMOVE_ENTRY),
            FlushMode::DISCARD
        );
    }

    #[test]
    fn test_flush_sector_writes_dirty_entry() {
        let (ctx, drive, slot) = setup(4);
        let mut g = ctx.lock();
        let id = dirty(&mut g, &slot, 3);

        assert!(flush_sector(&mut g, &slot, 3, FlushMode::WRITE_BACK).unwrap());
        assert_eq!(drive.sector_data(3), vec![0x13; 512]);
        assert!(!g.arena().unwrap().entry(id).is_dirty());

        // 已经干净，不再写
        assert!(!flush_sector(&mut g, &slot, 3, FlushMode::WRITE_BACK).unwrap());
        assert_eq!(drive.writes(), 1);
    }

    #[test]
    fn test_invalidate_moves_entry_to_cold_end() {
        let (ctx, drive, slot) = setup(4);
        let mut g = ctx.lock();
        let id = dirty(&mut g, &slot, 2);

        assert!(flush_sector(&mut g, &slot, 2, FlushMode::INVALIDATE).unwrap());
        assert_eq!(drive.write_log(), vec![2]);

        let arena = g.arena().unwrap();
        assert!(arena.index.lookup(DriveTag(0), 2).is_none());
        assert_eq!(arena.lru.order()[0], id);
        assert!(!arena.entry(id).is_valid());
        arena.check().unwrap();
    }

    #[test]
    fn test_discard_skips_write_back() {
        let (ctx, drive, slot) = setup(4);
        let mut g = ctx.lock();
        dirty(&mut g, &slot, 5);

        assert!(!flush_sector(&mut g, &slot, 5, FlushMode::DISCARD).unwrap());
        assert_eq!(drive.writes(), 0);
        assert!(g.arena().unwrap().index.is_empty());
    }

    #[test]
    fn test_invalidate_times_out_on_owned_entry() {
        let (ctx, _drive, slot) = setup(4);
        let mut g = ctx.lock();
        let id = resolve_miss(&mut g, &slot, 1, true).unwrap();

        let err = flush_sector(&mut g, &slot, 1, FlushMode::INVALIDATE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let arena = g.arena().unwrap();
        assert_eq!(arena.entry(id).refcount(), 1);
        assert_eq!(arena.index.lookup(DriveTag(0), 1), Some(id));
    }

    #[test]
    fn test_flush_drive_and_all() {
        let (ctx, drive, slot) = setup(4);
        let mut g = ctx.lock();
        dirty(&mut g, &slot, 0);
        dirty(&mut g, &slot, 1);
        let clean = resolve_miss(&mut g, &slot, 2, true).unwrap();
        g.release_entries([clean]);

        assert_eq!(flush_drive(&mut g, &slot, FlushMode::WRITE_BACK).unwrap(), 2);
        assert_eq!(drive.flushes(), 0);

        dirty(&mut g, &slot, 3);
        assert_eq!(flush_all(&mut g, FlushMode::WRITE_BACK).unwrap(), 1);
        assert_eq!(drive.flushes(), 1);
        g.arena().unwrap().check().unwrap();
    }

    #[test]
    fn test_write_back_failure_keeps_entry_dirty() {
        let (ctx, drive, slot) = setup(4);
        let mut g = ctx.lock();
        let id = dirty(&mut g, &slot, 4);
        drive.fail_writes_at(4);

        let err = flush_sector(&mut g, &slot, 4, FlushMode::INVALIDATE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        let arena = g.arena().unwrap();
        assert!(arena.entry(id).is_dirty());
        assert_eq!(arena.index.lookup(DriveTag(0), 4), Some(id));
        arena.check().unwrap();
    }
}
