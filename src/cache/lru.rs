//! 驱逐列表
//!
//! 无人持有的缓存项按 LRU 顺序排列：头部（冷端）最久未用，尾部（热端）最近使用。
//! 使用 `lru` crate 的 `LruCache` 作为有序链表，所有操作 O(1)。
//!
//! 加权：`window > 0` 时，从冷端起前 `window` 项中优先选择低权重项，
//! 避免低权重流量把高权重项挤出缓存；窗口内没有低权重项时退化为取冷端。
//!
//! 有效项（干净数据，再次请求时无需 I/O）和无效项（刚复位，可立即复用）都在列表中，
//! 无效项总是插入冷端，最先被复用。

use super::entry::{CacheEntry, EntryId, Weight};
use lru::LruCache;

/// 驱逐列表
pub struct EvictionList {
    list: LruCache<EntryId, Weight>,
    window: usize,
}

impl EvictionList {
    /// 创建驱逐列表
    ///
    /// * `window` - 加权窗口大小，0 关闭加权
    pub fn new(window: usize) -> Self {
        Self {
            list: LruCache::unbounded(),
            window,
        }
    }

    /// 插入缓存项
    ///
    /// 默认插入热端；`INSERT_ON_LRU` 或无效项插入冷端。
    pub fn insert(&mut self, entry: &CacheEntry) {
        debug_assert_eq!(entry.refcount(), 0, "owned entry inserted into eviction list");
        self.list.push(entry.id(), entry.weight);
        if entry.insert_on_lru() || !entry.is_valid() {
            self.list.demote(&entry.id());
        }
    }

    /// 把缓存项放回冷端（已知价值低，例如绕过缓存的读取）
    pub fn deselect(&mut self, entry: &CacheEntry) {
        self.list.push(entry.id(), entry.weight);
        self.list.demote(&entry.id());
    }

    /// 从列表中移除（持有缓存项之前调用）
    pub fn remove(&mut self, id: EntryId) -> bool {
        self.list.pop(&id).is_some()
    }

    /// 取出并移除最适合驱逐的缓存项，列表为空时返回 `None`
    pub fn select_oldest(&mut self) -> Option<EntryId> {
        let id = self.candidate()?;
        self.list.pop(&id);
        Some(id)
    }

    /// 只有当候选项满足 `accept` 时才取出
    pub fn select_oldest_if<F>(&mut self, accept: F) -> Option<EntryId>
    where
        F: FnOnce(EntryId) -> bool,
    {
        let id = self.candidate()?;
        if accept(id) {
            self.list.pop(&id);
            Some(id)
        } else {
            None
        }
    }

    fn candidate(&self) -> Option<EntryId> {
        if self.window > 0 {
            let light = self
                .list
                .iter()
                .rev()
                .take(self.window)
                .find(|(_, weight)| **weight == Weight::Low)
                .map(|(id, _)| *id);
            if light.is_some() {
                return light;
            }
        }
        self.list.peek_lru().map(|(id, _)| *id)
    }

    /// 是否在列表中
    pub fn contains(&self, id: EntryId) -> bool {
        self.list.contains(&id)
    }

    /// 从冷端到热端的顺序
    pub fn order(&self) -> alloc::vec::Vec<EntryId> {
        self.list.iter().rev().map(|(id, _)| *id).collect()
    }

    /// 列表长度
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// 列表是否为空
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl core::fmt::Debug for EvictionList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EvictionList")
            .field("len", &self.list.len())
            .field("window", &self.window)
            .finish()
    }
}
