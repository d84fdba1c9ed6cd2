//! 链式扩展
//!
//! 首项确定之后（命中或未命中），沿缓存项数组继续向后扫描紧邻的缓存项，
//! 把下一个、再下一个原生扇区也挂到同一个令牌上，一次调用返回一段连续缓冲区。
//!
//! 扫描按数组下标而不是扇区号进行：只有相邻缓存项的缓冲区在存储区里首尾相接，
//! 所以只有当原生扇区大小等于缓存项大小时才启用。
//!
//! 遇到以下情况停止：
//! - 缓存项有人持有
//! - 缓存项是脏的且持有别的扇区
//! - 目标扇区已在别处缓存或正在转移

use super::context::{Arena, ContextGuard, DriveSlot};
use super::entry::EntryId;
use crate::consts::MAX_TOKEN_ENTRIES;
use crate::error::Result;
use alloc::vec::Vec;

/// 链式项的用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainMode {
    /// 读取；`load` 为假时改挂的缓存项清零而不回读
    Read { load: bool },
    /// pinned write；链式项进入 `WRITE_PENDING`
    Write { load: bool, write_through: bool },
}

impl ChainMode {
    fn load(&self) -> bool {
        match self {
            ChainMode::Read { load } | ChainMode::Write { load, .. } => *load,
        }
    }
}

/// 当前驱动是否可以链式扩展
pub(crate) fn chaining_enabled(slot: &DriveSlot, entry_size: usize, limit: usize) -> bool {
    limit > 1 && slot.geometry.native_sector_size as usize == entry_size
}

/// 扩展以 `first` 开头的链，最多再挂 `room` 个原生扇区
///
/// `first` 必须已由调用者持有；写模式下它应当已经处于 `WRITE_PENDING`。
/// 返回挂上的缓存项数。载入失败时整条链回滚，`first` 不受影响。
pub(crate) fn extend_chain(
    g: &mut ContextGuard<'_>,
    slot: &DriveSlot,
    first: EntryId,
    room: usize,
    mode: ChainMode,
) -> Result<usize> {
    let tag = slot.tag;
    let total = slot.geometry.total_native_sectors;
    let limit = g.config().chain_limit();

    // (id, 是否改挂)
    let mut links: Vec<(EntryId, bool)> = Vec::new();
    let mut evicted = 0;
    {
        let arena = g.arena_mut()?;
        if room == 0 || !chaining_enabled(slot, arena.entry_size(), limit) {
            return Ok(0);
        }
        let room = room
            .min(limit - 1)
            .min(MAX_TOKEN_ENTRIES - 1)
            .min(arena.len() - 1 - first as usize);
        let base = arena.entry(first).sector;

        let Arena { entries, index, lru, .. } = arena;
        for k in 1..=room {
            let id = first as usize + k;
            let Some(target) = base.checked_add(k as u32).filter(|t| *t < total) else {
                break;
            };
            let entry = &mut entries[id];
            if entry.refcount() != 0 {
                break;
            }
            let reuse = entry.holds(tag, target);
            if !reuse && ((entry.is_valid() && entry.is_dirty()) || index.is_claimed(tag, target)) {
                break;
            }

            lru.remove(id as EntryId);
            entry.retain();
            if !reuse {
                if entry.is_valid() {
                    index.remove(entry);
                    evicted += 1;
                }
                entry.assign(tag, target);
                index.reserve(tag, target);
            }
            if let ChainMode::Write { write_through, .. } = mode {
                entry.begin_write(write_through);
            }
            links.push((id as EntryId, !reuse));
        }
    }

    if links.is_empty() {
        return Ok(0);
    }

    if let Err(err) = fill(g, slot, &links, mode.load()) {
        let arena = g.arena_mut()?;
        for &(id, repurposed) in &links {
            if repurposed {
                let sector = arena.entry(id).sector;
                arena.index.unreserve(tag, sector);
                arena.entry_mut(id).reset();
                arena.lru.insert(&arena.entries[id as usize]);
            } else {
                arena.entry_mut(id).abandon_write();
                arena.release_entry(id);
            }
        }
        g.notify();
        log::warn!("[CHAIN] {}:{} rolled back after load failure", tag, first);
        return Err(err);
    }

    let arena = g.arena_mut()?;
    for &(id, repurposed) in &links {
        if repurposed {
            let entry = arena.entry_mut(id);
            entry.mark_valid();
            let sector = entry.sector;
            arena.index.insert(&arena.entries[id as usize]);
            arena.index.unreserve(tag, sector);
        }
    }
    g.stats.chained_entries += links.len() as u64;
    g.stats.evictions += evicted;
    g.notify();

    log::trace!("[CHAIN] entry {} +{} entries", first, links.len());
    Ok(links.len())
}

/// 为改挂的缓存项准备数据：按连续段载入，或清零
fn fill(g: &mut ContextGuard<'_>, slot: &DriveSlot, links: &[(EntryId, bool)], load: bool) -> Result<()> {
    if !load {
        let ids: Vec<EntryId> = links.iter().filter(|(_, r)| *r).map(|(id, _)| *id).collect();
        return g.zero_entries(slot.geometry.native_sector_size as usize, &ids);
    }

    let mut group = Vec::new();
    for &(id, repurposed) in links {
        if repurposed {
            group.push(id);
        } else if !group.is_empty() {
            g.load_entries(slot, &group)?;
            group.clear();
        }
    }
    if !group.is_empty() {
        g.load_entries(slot, &group)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::context::CacheContext;
    use crate::cache::miss::resolve_miss;
    use crate::drive::{DriveGeometry, DriveTag, MediaDrive, RamDrive, TransactionRecord};
    use crate::error::ErrorKind;
    use alloc::sync::Arc;
    use alloc::vec;

    fn setup(entries: usize, config: CacheConfig, drive: RamDrive) -> (CacheContext, Arc<RamDrive>, DriveSlot) {
        let ctx = CacheContext::new(config);
        let drive = Arc::new(drive);
        let geometry = DriveGeometry::probe(&*drive, config.max_sector_size).unwrap();
        let slot = DriveSlot {
            tag: DriveTag(0),
            drive: drive.clone() as Arc<dyn MediaDrive>,
            geometry,
        };
        {
            let mut g = ctx.lock();
            g.arena = Some(Arena::new(vec![0u8; entries * config.max_sector_size], ctx.config()).unwrap());
            g.drives.insert(DriveTag(0), slot.clone());
        }
        (ctx, drive, slot)
    }

    #[test]
    fn test_chain_loads_following_sectors() {
        let drive = RamDrive::new(512, 32);
        for s in 0..4 {
            drive.set_sector_data(s, &[s as u8 + 1; 512]);
        }
        let (ctx, drive, slot) = setup(8, CacheConfig::default(), drive);
        let mut g = ctx.lock();

        let first = resolve_miss(&mut g, &slot, 0, true).unwrap();
        let extra = extend_chain(&mut g, &slot, first, 3, ChainMode::Read { load: true }).unwrap();
        assert_eq!(extra, 3);
        assert_eq!(
            drive.transactions(),
            vec![TransactionRecord { start: 1, count: 3, is_read: true }]
        );

        let arena = g.arena().unwrap();
        for k in 0..4u16 {
            let id = first + k;
            assert_eq!(arena.index.lookup(DriveTag(0), k as u32), Some(id));
            assert_eq!(arena.entry(id).refcount(), 1);
        }
        let bytes = unsafe { arena.storage.bytes(arena.storage.entry_offset(first), 4 * 512) };
        for k in 0..4 {
            assert!(bytes[k * 512..(k + 1) * 512].iter().all(|&b| b == k as u8 + 1));
        }
        assert_eq!(g.stats.chained_entries, 3);
        arena.check().unwrap();
    }

    #[test]
    fn test_chain_respects_limit() {
        let config = CacheConfig::default().with_max_chain_length(2);
        let (ctx, _drive, slot) = setup(8, config, RamDrive::new(512, 32));
        let mut g = ctx.lock();

        let first = resolve_miss(&mut g, &slot, 0, true).unwrap();
        let extra = extend_chain(&mut g, &slot, first, 5, ChainMode::Read { load: true }).unwrap();
        assert_eq!(extra, 1);
    }

    #[test]
    fn test_chain_stops_at_owned_entry() {
        let (ctx, _drive, slot) = setup(8, CacheConfig::default(), RamDrive::new(512, 32));
        let mut g = ctx.lock();

        let first = resolve_miss(&mut g, &slot, 0, true).unwrap();
        g.arena_mut().unwrap().claim(first + 2);

        let extra = extend_chain(&mut g, &slot, first, 4, ChainMode::Read { load: true }).unwrap();
        assert_eq!(extra, 1);
    }

    #[test]
    fn test_chain_stops_at_sector_cached_elsewhere() {
        let (ctx, _drive, slot) = setup(8, CacheConfig::default(), RamDrive::new(512, 32));
        let mut g = ctx.lock();

        // 扇区 2 先被缓存在某个数组位置
        let other = resolve_miss(&mut g, &slot, 2, true).unwrap();
        g.release_entries([other]);

        let first = resolve_miss(&mut g, &slot, 1, true).unwrap();
        assert_eq!(first, other + 1);
        let extra = extend_chain(&mut g, &slot, first, 4, ChainMode::Read { load: true }).unwrap();
        assert_eq!(extra, 0);
        assert_eq!(g.arena().unwrap().index.lookup(DriveTag(0), 2), Some(other));
    }

    #[test]
    fn test_chain_disabled_when_native_smaller_than_entry() {
        let config = CacheConfig::default().with_max_sector_size(1024);
        let (ctx, _drive, slot) = setup(8, config, RamDrive::new(512, 32));
        let mut g = ctx.lock();

        let first = resolve_miss(&mut g, &slot, 0, true).unwrap();
        let extra = extend_chain(&mut g, &slot, first, 4, ChainMode::Read { load: true }).unwrap();
        assert_eq!(extra, 0);
    }

    #[test]
    fn test_write_chain_marks_pending_without_readback() {
        let (ctx, drive, slot) = setup(4, CacheConfig::default(), RamDrive::new(512, 32));
        let mut g = ctx.lock();

        let first = resolve_miss(&mut g, &slot, 4, false).unwrap();
        g.arena_mut().unwrap().entry_mut(first).begin_write(false);
        let mode = ChainMode::Write { load: false, write_through: false };
        let extra = extend_chain(&mut g, &slot, first, 3, mode).unwrap();
        assert!(extra >= 1);
        assert_eq!(drive.reads(), 0);

        let arena = g.arena().unwrap();
        for k in 1..=extra as u16 {
            assert!(arena.entry(first + k).is_write_pending());
        }
        arena.check().unwrap();
    }

    #[test]
    fn test_chain_load_failure_rolls_back() {
        let (ctx, drive, slot) = setup(8, CacheConfig::default(), RamDrive::new(512, 32));
        drive.fail_reads_at(2);
        let mut g = ctx.lock();

        let first = resolve_miss(&mut g, &slot, 0, true).unwrap();
        let err = extend_chain(&mut g, &slot, first, 3, ChainMode::Read { load: true }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let arena = g.arena().unwrap();
        assert_eq!(arena.index.len(), 1);
        assert_eq!(arena.index.reserved_count(), 0);
        assert_eq!(arena.entry(first).refcount(), 1);
        arena.check().unwrap();
    }
}
