//! 未命中处理
//!
//! 从驱逐列表取出最旧的无人持有项，必要时先写回脏数据，再为新扇区载入数据。
//! 驱动支持多 plane 传输时，写回和载入都尽量合并成一个多扇区事务：
//!
//! - 需要写回时，顺着旧扇区号向后收集已索引、脏、无人持有的缓存项一起写回；
//!   读未命中时这些缓存项同时被驱逐，用来承载后续的目标扇区
//! - 不需要写回的读未命中，从驱逐列表再取若干干净项，一起载入
//!
//! 目标扇区和正在写回的旧扇区在转移期间保持预留，其他请求遇到预留键会等待，
//! 不会为同一扇区再建一个缓存项。下一个目标扇区已被缓存或预留时，传输在那里截断。

use super::context::{Arena, ContextGuard, DriveSlot};
use super::entry::EntryId;
use crate::drive::DriveTag;
use crate::error::Result;
use alloc::vec;
use alloc::vec::Vec;

/// 为 `(slot, sector)` 取得一个缓存项
///
/// 调用者已确认该扇区既未索引也未预留。返回的缓存项已持有（refcount 1）、
/// 有效且已加入索引；`load` 为假时缓冲区被清零。
///
/// 失败时所有取得的缓存项都已归还：写回失败时回到索引和驱逐列表，
/// 载入失败时只回到驱逐列表。
pub(crate) fn resolve_miss(
    g: &mut ContextGuard<'_>,
    slot: &DriveSlot,
    sector: u32,
    load: bool,
) -> Result<EntryId> {
    let tag = slot.tag;
    let total = slot.geometry.total_native_sectors;
    let planes = slot.geometry.plane_count.max(1);

    g.arena_mut()?.index.reserve(tag, sector);

    let first = loop {
        if let Some(id) = g.arena_mut()?.lru.select_oldest() {
            break id;
        }
        log::trace!("[MISS] {}:{} waiting for an unowned entry", tag, sector);
        g.sleep_tick();
    };

    let (old, dirty_victim) = {
        let victim = g.arena()?.entry(first);
        ((victim.drive, victim.sector), victim.is_valid() && victim.is_dirty())
    };
    let old_slot = if dirty_victim {
        match g.drive(old.0) {
            Ok(slot) => Some(slot),
            Err(err) => {
                let arena = g.arena_mut()?;
                arena.lru.insert(&arena.entries[first as usize]);
                arena.index.unreserve(tag, sector);
                g.notify();
                return Err(err);
            }
        }
    } else {
        None
    };

    let mut run = vec![first];
    let mut dirty = Vec::new();
    {
        let Arena { entries, index, lru, .. } = g.arena_mut()?;
        let victim = &entries[first as usize];
        victim.retain();
        if victim.is_valid() {
            index.remove(victim);
        }

        if let Some(old_slot) = &old_slot {
            index.reserve(old.0, old.1);
            dirty.push(first);

            let limit = planes.min(old_slot.geometry.plane_count.max(1));
            let mut extend_run = load;
            for i in 1..limit {
                let Some(next) = old.1.checked_add(i) else { break };
                let Some(id) = index.lookup(old.0, next) else { break };
                let entry = &entries[id as usize];
                if !entry.is_dirty() || entry.is_write_pending() || entry.refcount() != 0 {
                    break;
                }
                lru.remove(id);
                entry.retain();
                index.remove(entry);
                index.reserve(old.0, next);
                dirty.push(id);

                if extend_run {
                    match sector.checked_add(i) {
                        Some(target) if target < total && !index.is_claimed(tag, target) => {
                            index.reserve(tag, target);
                            run.push(id);
                        }
                        _ => extend_run = false,
                    }
                }
            }
        } else if load {
            for i in 1..planes {
                let target = match sector.checked_add(i) {
                    Some(target) if target < total => target,
                    _ => break,
                };
                if index.is_claimed(tag, target) {
                    break;
                }
                let clean = lru.select_oldest_if(|id| {
                    let entry = &entries[id as usize];
                    !(entry.is_valid() && entry.is_dirty())
                });
                let Some(id) = clean else { break };
                let entry = &entries[id as usize];
                entry.retain();
                if entry.is_valid() {
                    index.remove(entry);
                }
                index.reserve(tag, target);
                run.push(id);
            }
        }
    }

    if let Some(old_slot) = &old_slot {
        if let Err(err) = g.store_entries(old_slot, &dirty) {
            let arena = g.arena_mut()?;
            for (i, &id) in dirty.iter().enumerate() {
                arena.index.unreserve(old.0, old.1 + i as u32);
                arena.index.insert(&arena.entries[id as usize]);
                arena.release_entry(id);
            }
            for i in 0..run.len() {
                arena.index.unreserve(tag, sector + i as u32);
            }
            g.notify();
            return Err(err);
        }

        let arena = g.arena_mut()?;
        for (i, &id) in dirty.iter().enumerate() {
            arena.entry_mut(id).mark_clean();
            arena.index.unreserve(old.0, old.1 + i as u32);
            if !run.contains(&id) {
                arena.index.insert(&arena.entries[id as usize]);
                arena.release_entry(id);
            }
        }
        g.stats.flushes += dirty.len() as u64;
        log::debug!(
            "[MISS] wrote back {} entries from {}:{}",
            dirty.len(),
            old.0,
            old.1
        );
    }

    let mut evicted = 0;
    {
        let arena = g.arena_mut()?;
        for (i, &id) in run.iter().enumerate() {
            let entry = arena.entry_mut(id);
            if entry.is_valid() {
                evicted += 1;
            }
            entry.assign(tag, sector + i as u32);
        }
    }
    g.stats.evictions += evicted;

    if load {
        if let Err(err) = g.load_entries(slot, &run) {
            let arena = g.arena_mut()?;
            for (i, &id) in run.iter().enumerate() {
                arena.index.unreserve(tag, sector + i as u32);
                arena.entry_mut(id).reset();
                arena.lru.insert(&arena.entries[id as usize]);
            }
            g.notify();
            return Err(err);
        }
    } else {
        g.zero_entries(slot.geometry.native_sector_size as usize, &run)?;
    }

    let arena = g.arena_mut()?;
    for (i, &id) in run.iter().enumerate() {
        arena.entry_mut(id).mark_valid();
        arena.index.insert(&arena.entries[id as usize]);
        arena.index.unreserve(tag, sector + i as u32);
    }
    for &id in &run[1..] {
        arena.release_entry(id);
    }
    g.notify();

    log::debug!(
        "[MISS] {}:{} -> entry {} (run {}, loaded {})",
        tag,
        sector,
        first,
        run.len(),
        load
    );
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::context::CacheContext;
    use crate::drive::{DriveGeometry, MediaDrive, RamDrive, TransactionRecord};
    use crate::error::ErrorKind;
    use alloc::sync::Arc;

    fn setup(entries: usize, drive: RamDrive) -> (CacheContext, Arc<RamDrive>, DriveSlot) {
        let ctx = CacheContext::new(CacheConfig::default());
        let drive = Arc::new(drive);
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

    /// 让缓存项持有一个脏扇区并放回驱逐列表
    fn make_dirty(g: &mut ContextGuard<'_>, slot: &DriveSlot, sector: u32, fill: u8) -> EntryId {
        let id = resolve_miss(g, slot, sector, false).unwrap();
        let arena = g.arena_mut().unwrap();
        // SAFETY: 测试线程是唯一持有者
        unsafe {
            let offset = arena.storage.entry_offset(id);
            arena.storage.bytes_mut(offset, 512).fill(fill);
        }
        arena.entry_mut(id).mark_dirty();
        arena.release_entry(id);
        id
    }

    #[test]
    fn test_miss_loads_from_drive() {
        let drive = RamDrive::new(512, 16);
        drive.set_sector_data(5, &[0x55; 512]);
        let (ctx, drive, slot) = setup(4, drive);
        let mut g = ctx.lock();

        let id = resolve_miss(&mut g, &slot, 5, true).unwrap();
        let arena = g.arena().unwrap();
        assert_eq!(arena.index.lookup(DriveTag(0), 5), Some(id));
        assert_eq!(arena.entry(id).refcount(), 1);
        assert!(arena.entry(id).is_valid());
        assert_eq!(arena.index.reserved_count(), 0);
        let data = unsafe { arena.storage.bytes(arena.storage.entry_offset(id), 512) };
        assert!(data.iter().all(|&b| b == 0x55));
        assert_eq!(drive.reads(), 1);
        arena.check().unwrap();
    }

    #[test]
    fn test_miss_without_load_zero_fills() {
        let drive = RamDrive::new(512, 16);
        drive.set_sector_data(2, &[0x22; 512]);
        let (ctx, drive, slot) = setup(2, drive);
        let mut g = ctx.lock();

        let id = resolve_miss(&mut g, &slot, 2, false).unwrap();
        let arena = g.arena().unwrap();
        let data = unsafe { arena.storage.bytes(arena.storage.entry_offset(id), 512) };
        assert!(data.iter().all(|&b| b == 0));
        assert_eq!(drive.reads(), 0);
    }

    #[test]
    fn test_dirty_victim_is_written_back_first() {
        let (ctx, drive, slot) = setup(1, RamDrive::new(512, 16));
        let mut g = ctx.lock();
        make_dirty(&mut g, &slot, 3, 0x33);

        let id = resolve_miss(&mut g, &slot, 4, true).unwrap();
        assert_eq!(drive.sector_data(3), vec![0x33; 512]);
        assert_eq!(drive.write_log(), vec![3]);

        let arena = g.arena().unwrap();
        assert!(arena.index.lookup(DriveTag(0), 3).is_none());
        assert_eq!(arena.index.lookup(DriveTag(0), 4), Some(id));
        assert_eq!(g.stats.evictions, 1);
        assert_eq!(g.stats.flushes, 1);
    }

    #[test]
    fn test_write_back_failure_restores_entries() {
        let (ctx, drive, slot) = setup(1, RamDrive::new(512, 16));
        let mut g = ctx.lock();
        let id = make_dirty(&mut g, &slot, 3, 0x33);
        drive.fail_writes_at(3);

        let err = resolve_miss(&mut g, &slot, 4, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let arena = g.arena().unwrap();
        assert_eq!(arena.index.lookup(DriveTag(0), 3), Some(id));
        assert!(arena.entry(id).is_dirty());
        assert_eq!(arena.entry(id).refcount(), 0);
        assert!(arena.lru.contains(id));
        assert_eq!(arena.index.reserved_count(), 0);
        arena.check().unwrap();
    }

    #[test]
    fn test_load_failure_returns_entry_to_lru_only() {
        let (ctx, drive, slot) = setup(2, RamDrive::new(512, 16));
        drive.fail_reads_at(6);
        let mut g = ctx.lock();

        let err = resolve_miss(&mut g, &slot, 6, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let arena = g.arena().unwrap();
        assert!(arena.index.is_empty());
        assert_eq!(arena.lru.len(), 2);
        assert_eq!(arena.index.reserved_count(), 0);
        arena.check().unwrap();
    }

    #[test]
    fn test_multi_plane_load_is_one_transaction() {
        let (ctx, drive, slot) = setup(4, RamDrive::new(512, 16).with_planes(2));
        let mut g = ctx.lock();

        let id = resolve_miss(&mut g, &slot, 8, true).unwrap();
        assert_eq!(
            drive.transactions(),
            vec![TransactionRecord { start: 8, count: 2, is_read: true }]
        );

        let arena = g.arena().unwrap();
        assert_eq!(arena.index.lookup(DriveTag(0), 8), Some(id));
        let second = arena.index.lookup(DriveTag(0), 9).unwrap();
        assert_eq!(arena.entry(second).refcount(), 0);
        assert!(arena.lru.contains(second));
        arena.check().unwrap();
    }

    #[test]
    fn test_multi_plane_load_narrows_at_cached_sector() {
        let (ctx, drive, slot) = setup(4, RamDrive::new(512, 16).with_planes(2));
        let mut g = ctx.lock();
        let cached = resolve_miss(&mut g, &slot, 9, true).unwrap();
        g.release_entries([cached]);
        drive.reset_counters();

        resolve_miss(&mut g, &slot, 8, true).unwrap();
        assert_eq!(drive.reads(), 1);
        assert!(drive.transactions().is_empty());
        assert_eq!(g.arena().unwrap().index.lookup(DriveTag(0), 9), Some(cached));
    }

    #[test]
    fn test_multi_plane_write_back_batches_following_sectors() {
        let (ctx, drive, slot) = setup(2, RamDrive::new(512, 16).with_planes(2));
        let mut g = ctx.lock();
        make_dirty(&mut g, &slot, 0, 0xA0);
        make_dirty(&mut g, &slot, 1, 0xA1);
        drive.reset_counters();

        resolve_miss(&mut g, &slot, 10, true).unwrap();
        assert_eq!(
            drive.transactions(),
            vec![
                TransactionRecord { start: 0, count: 2, is_read: false },
                TransactionRecord { start: 10, count: 2, is_read: true },
            ]
        );
        assert_eq!(drive.sector_data(1), vec![0xA1; 512]);
        assert_eq!(g.stats.flushes, 2);
        assert_eq!(g.stats.evictions, 2);
        g.arena().unwrap().check().unwrap();
    }
}
