//! 扇区索引
//!
//! 跨所有驱动的有序映射，键为 `(drive << 32) | sector`。
//! 一个扇区出现在索引中就意味着它已被缓存，所以插入/移除必须与缓存项标志的
//! 变化在同一把锁下完成。
//!
//! 索引另外维护一组*预留键*：正在从介质载入、或脏数据正在写回的扇区。
//! 查找未命中但键已预留时，调用者应等待预留解除后重新查找，
//! 从而保证同一扇区最多只有一个缓存项。

use super::entry::{CacheEntry, EntryId};
use crate::consts::DRIVE_KEY_SHIFT;
use crate::drive::DriveTag;
use alloc::collections::{BTreeMap, BTreeSet};

/// 扇区索引
#[derive(Debug, Default)]
pub struct SectorIndex {
    map: BTreeMap<u64, EntryId>,
    reserved: BTreeSet<u64>,
}

impl SectorIndex {
    /// 创建空索引
    pub fn new() -> Self {
        Self::default()
    }

    /// 组合索引键
    pub fn key(drive: DriveTag, sector: u32) -> u64 {
        ((drive.0 as u64) << DRIVE_KEY_SHIFT) | sector as u64
    }

    /// 查找缓存项
    pub fn lookup(&self, drive: DriveTag, sector: u32) -> Option<EntryId> {
        self.map.get(&Self::key(drive, sector)).copied()
    }

    /// 插入缓存项（要求 `VALID`）
    pub fn insert(&mut self, entry: &CacheEntry) {
        debug_assert!(entry.is_valid(), "indexing an invalid entry");
        let prev = self.map.insert(Self::key(entry.drive, entry.sector), entry.id());
        debug_assert!(
            prev.is_none() || prev == Some(entry.id()),
            "two entries indexed for one sector"
        );
    }

    /// 移除缓存项（要求 `VALID`）
    ///
    /// 只有当键当前映射到该项时才会移除。
    pub fn remove(&mut self, entry: &CacheEntry) -> bool {
        debug_assert!(entry.is_valid(), "removing an invalid entry from the index");
        let key = Self::key(entry.drive, entry.sector);
        if self.map.get(&key) == Some(&entry.id()) {
            self.map.remove(&key);
            true
        } else {
            false
        }
    }

    /// 预留键
    pub fn reserve(&mut self, drive: DriveTag, sector: u32) -> bool {
        self.reserved.insert(Self::key(drive, sector))
    }

    /// 解除预留
    pub fn unreserve(&mut self, drive: DriveTag, sector: u32) {
        self.reserved.remove(&Self::key(drive, sector));
    }

    /// 键是否已预留
    pub fn is_reserved(&self, drive: DriveTag, sector: u32) -> bool {
        self.reserved.contains(&Self::key(drive, sector))
    }

    /// 扇区是否已缓存或正在转移
    pub fn is_claimed(&self, drive: DriveTag, sector: u32) -> bool {
        self.lookup(drive, sector).is_some() || self.is_reserved(drive, sector)
    }

    /// 当前预留数
    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    /// 某个驱动的全部缓存扇区，按扇区号升序
    pub fn sectors_of(&self, drive: DriveTag) -> impl Iterator<Item = (u32, EntryId)> + '_ {
        let start = Self::key(drive, 0);
        let end = Self::key(drive, u32::MAX);
        self.map
            .range(start..=end)
            .map(|(key, id)| (*key as u32, *id))
    }

    /// 全部 `(drive, sector, id)`，按键升序
    pub fn iter(&self) -> impl Iterator<Item = (DriveTag, u32, EntryId)> + '_ {
        self.map
            .iter()
            .map(|(key, id)| (DriveTag((key >> DRIVE_KEY_SHIFT) as u8), *key as u32, *id))
    }

    /// 已索引的缓存项数
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// 索引是否为空
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn valid_entry(id: EntryId, drive: u8, sector: u32) -> CacheEntry {
        let mut entry = CacheEntry::new(id);
        entry.assign(DriveTag(drive), sector);
        entry.mark_valid();
        entry
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(SectorIndex::key(DriveTag(1), 5), (1u64 << 32) | 5);
        assert_ne!(SectorIndex::key(DriveTag(0), 5), SectorIndex::key(DriveTag(1), 5));
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut index = SectorIndex::new();
        let entry = valid_entry(3, 0, 42);

        index.insert(&entry);
        assert_eq!(index.lookup(DriveTag(0), 42), Some(3));
        assert_eq!(index.lookup(DriveTag(1), 42), None);
        assert_eq!(index.len(), 1);

        assert!(index.remove(&entry));
        assert!(index.lookup(DriveTag(0), 42).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_ignores_foreign_mapping() {
        let mut index = SectorIndex::new();
        let owner = valid_entry(1, 0, 8);
        let stranger = valid_entry(2, 0, 8);

        index.insert(&owner);
        assert!(!index.remove(&stranger));
        assert_eq!(index.lookup(DriveTag(0), 8), Some(1));
    }

    #[test]
    fn test_reservations() {
        let mut index = SectorIndex::new();
        assert!(index.reserve(DriveTag(0), 9));
        assert!(!index.reserve(DriveTag(0), 9));
        assert!(index.is_reserved(DriveTag(0), 9));
        assert!(index.is_claimed(DriveTag(0), 9));
        assert!(index.lookup(DriveTag(0), 9).is_none());

        index.unreserve(DriveTag(0), 9);
        assert!(!index.is_claimed(DriveTag(0), 9));
        assert_eq!(index.reserved_count(), 0);
    }

    #[test]
    fn test_sectors_of_is_ordered_per_drive() {
        let mut index = SectorIndex::new();
        index.insert(&valid_entry(0, 1, 30));
        index.insert(&valid_entry(1, 0, 5));
        index.insert(&valid_entry(2, 1, 10));
        index.insert(&valid_entry(3, 2, 1));

        let sectors: Vec<u32> = index.sectors_of(DriveTag(1)).map(|(s, _)| s).collect();
        assert_eq!(sectors, alloc::vec![10, 30]);
    }
}
