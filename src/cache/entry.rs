//! 缓存项结构
//!
//! 一个缓存项缓冲一个原生扇区。缓存项在初始化时按固定数量分配，之后只会被
//! 重新赋予 `(drive, sector)` 身份，不会单独分配或释放。

use crate::drive::DriveTag;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

/// 缓存项 ID（在缓存项数组中的下标）
///
/// 在分配时确定，令牌和索引都携带它，而不是从地址推算。
pub type EntryId = u16;

bitflags! {
    /// 缓存项状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// 已载入有效数据
        const VALID         = 0x01;
        /// 缓冲区与介质不一致
        const DIRTY         = 0x02;
        /// 有一个 pinned write 尚未完成
        const WRITE_PENDING = 0x04;
        /// pinned write 完成时需要写穿到介质
        const WRITE_THROUGH = 0x08;
        /// 释放时插入 LRU 冷端而不是热端
        const INSERT_ON_LRU = 0x10;
    }
}

/// 驱逐权重
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Weight {
    /// 低权重，加权窗口内优先驱逐
    #[default]
    Low,
    /// 高权重
    High,
}

/// 缓存项
///
/// 不变量：
/// - `reset()` 之后 `VALID` 为假，只有成功载入或写入才会置位
/// - 在索引中 ⇔ `VALID`（转移中已预留键的项除外）
/// - 在驱逐列表中 ⇔ `refcount == 0`，由调用者显式插入/移除
/// - `WRITE_PENDING` ⇒ `refcount >= 1`
/// - `WRITE_THROUGH` ⇒ `WRITE_PENDING`
#[derive(Debug)]
pub struct CacheEntry {
    /// 驱动标签
    pub drive: DriveTag,
    /// 原生扇区号（相对驱动，不是相对分区）
    pub sector: u32,
    /// 状态标志
    pub flags: EntryFlags,
    /// 驱逐权重
    pub weight: Weight,
    refcount: AtomicU32,
    id: EntryId,
}

impl CacheEntry {
    /// 创建缓存项
    pub fn new(id: EntryId) -> Self {
        Self {
            drive: DriveTag::default(),
            sector: 0,
            flags: EntryFlags::empty(),
            weight: Weight::Low,
            refcount: AtomicU32::new(0),
            id,
        }
    }

    /// 缓存项 ID
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// 是否持有 `(drive, sector)`
    pub fn holds(&self, drive: DriveTag, sector: u32) -> bool {
        self.is_valid() && self.drive == drive && self.sector == sector
    }

    /// 清除全部状态
    ///
    /// 只能在缓存项既不在索引也不在驱逐列表时调用。
    pub fn reset(&mut self) {
        self.drive = DriveTag::default();
        self.sector = 0;
        self.flags = EntryFlags::empty();
        self.weight = Weight::Low;
        self.refcount.store(0, Ordering::SeqCst);
    }

    /// 赋予新身份，保留引用计数
    pub fn assign(&mut self, drive: DriveTag, sector: u32) {
        self.drive = drive;
        self.sector = sector;
        self.flags = EntryFlags::empty();
        self.weight = Weight::Low;
    }

    /// 增加引用计数，返回新值
    pub fn retain(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 减少引用计数，返回新值
    ///
    /// 计数已经为 0 时不做修改并返回 `None`。
    pub fn release(&self) -> Option<u32> {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    /// 当前引用计数
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// 无效或无人持有
    pub fn is_unowned(&self) -> bool {
        !self.is_valid() || self.refcount() == 0
    }

    /// 数据是否有效
    pub fn is_valid(&self) -> bool {
        self.flags.contains(EntryFlags::VALID)
    }

    /// 是否是脏项
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(EntryFlags::DIRTY)
    }

    /// 是否有未完成的 pinned write
    pub fn is_write_pending(&self) -> bool {
        self.flags.contains(EntryFlags::WRITE_PENDING)
    }

    /// 是否需要写穿
    pub fn is_write_through(&self) -> bool {
        self.flags.contains(EntryFlags::WRITE_THROUGH)
    }

    /// 释放时是否插入冷端
    pub fn insert_on_lru(&self) -> bool {
        self.flags.contains(EntryFlags::INSERT_ON_LRU)
    }

    /// 标记有效
    pub fn mark_valid(&mut self) {
        self.flags.insert(EntryFlags::VALID);
    }

    /// 标记为脏
    pub fn mark_dirty(&mut self) {
        self.flags.insert(EntryFlags::DIRTY);
    }

    /// 标记为干净（已写入介质）
    pub fn mark_clean(&mut self) {
        self.flags.remove(EntryFlags::DIRTY);
    }

    /// 开始一个 pinned write
    pub fn begin_write(&mut self, write_through: bool) {
        debug_assert!(self.refcount() >= 1, "write pending on an unowned entry");
        self.flags.insert(EntryFlags::WRITE_PENDING);
        self.flags.set(EntryFlags::WRITE_THROUGH, write_through);
    }

    /// 结束 pinned write：数据变为有效且为脏
    pub fn finish_write(&mut self) {
        self.flags.remove(EntryFlags::WRITE_PENDING | EntryFlags::WRITE_THROUGH);
        self.flags.insert(EntryFlags::VALID | EntryFlags::DIRTY);
    }

    /// 放弃 pinned write，不改变数据状态
    pub fn abandon_write(&mut self) {
        self.flags.remove(EntryFlags::WRITE_PENDING | EntryFlags::WRITE_THROUGH);
    }

    /// 设置释放时的 LRU 位置提示
    pub fn set_insert_on_lru(&mut self, cold: bool) {
        self.flags.set(EntryFlags::INSERT_ON_LRU, cold);
    }
}

/// 缓存项上的等待条件
///
/// 等待时上下文锁被完全释放，超过上限后返回 `Timeout`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryWait {
    /// 等待 pinned write 完成
    WriteComplete,
    /// 等待无人持有
    Unowned,
    /// 等待引用计数降到 n 及以下
    RefcountAtMost(u32),
}

impl EntryWait {
    /// 条件是否满足
    pub fn satisfied(&self, entry: &CacheEntry) -> bool {
        match self {
            EntryWait::WriteComplete => !entry.is_write_pending(),
            EntryWait::Unowned => entry.is_unowned(),
            EntryWait::RefcountAtMost(n) => entry.refcount() <= *n,
        }
    }
}
