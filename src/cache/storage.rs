//! 缓存存储区
//!
//! 所有缓存项共享一块连续内存，第 `i` 项的缓冲区位于 `i * entry_size`，
//! 在初始化时确定后不再变化。相邻缓存项的缓冲区在字节上连续，
//! 链式访问依赖这一点返回一段跨越多个缓存项的缓冲区。
//!
//! 访问规则由引用计数协议保证：
//! - 写者（pinned write、写入未命中项、链式写）在取得缓存项时是唯一持有者，
//!   并在整个写入期间保持 `WRITE_PENDING`
//! - 读者只在 `WRITE_PENDING` 清除后读取
//! - 驱逐、复位只针对 `refcount == 0` 的缓存项

use super::entry::EntryId;
use crate::drive::MediaDrive;
use crate::error::Result;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

/// 缓存存储区
pub struct SectorStorage {
    cells: Box<[UnsafeCell<u8>]>,
    entry_size: usize,
}

// SAFETY: 对单元的并发访问由上面描述的引用计数协议串行化，
// 同一字节不会同时存在写者和其他访问者。
unsafe impl Sync for SectorStorage {}

impl SectorStorage {
    /// 接管调用者提供的缓冲区，只保留前 `entries * entry_size` 字节
    pub fn new(buffer: Vec<u8>, entry_size: usize, entries: usize) -> Self {
        let cells: Vec<UnsafeCell<u8>> = buffer
            .into_iter()
            .take(entries * entry_size)
            .map(UnsafeCell::new)
            .collect();
        Self {
            cells: cells.into_boxed_slice(),
            entry_size,
        }
    }

    /// 每个缓存项的缓冲区大小
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// 总字节数
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// 缓存项缓冲区的起始偏移
    pub fn entry_offset(&self, id: EntryId) -> usize {
        id as usize * self.entry_size
    }

    fn raw(&self, offset: usize, len: usize) -> *mut u8 {
        let cells = &self.cells[offset..offset + len];
        UnsafeCell::raw_get(cells.as_ptr())
    }

    /// 共享访问一段存储
    ///
    /// # Safety
    ///
    /// 调用者必须持有覆盖这段字节的缓存项，且这些缓存项没有活动的写者。
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        // SAFETY: 范围已由 raw() 做边界检查，别名规则由调用者保证
        unsafe { core::slice::from_raw_parts(self.raw(offset, len), len) }
    }

    /// 独占访问一段存储
    ///
    /// # Safety
    ///
    /// 调用者必须是覆盖这段字节的全部缓存项的唯一写者，且在返回的切片存活期间
    /// 没有其他访问。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        // SAFETY: 同上
        unsafe { core::slice::from_raw_parts_mut(self.raw(offset, len), len) }
    }

    /// 清零缓存项缓冲区的前 `len` 字节
    ///
    /// # Safety
    ///
    /// 同 [`Self::bytes_mut`]。
    pub unsafe fn zero(&self, id: EntryId, len: usize) {
        // SAFETY: 由调用者保证独占
        unsafe { self.bytes_mut(self.entry_offset(id), len) }.fill(0);
    }

    /// 从驱动载入一组连续扇区，`ids[i]` 接收扇区 `start + i`
    ///
    /// # Safety
    ///
    /// 同 [`Self::bytes_mut`]，对 `ids` 中的每一项成立。
    pub unsafe fn load_run(
        &self,
        drive: &dyn MediaDrive,
        start: u32,
        ids: &[EntryId],
        sector_size: usize,
    ) -> Result<()> {
        transaction(drive, start, ids.len(), true, |i| {
            // SAFETY: 由调用者保证独占
            let buf = unsafe { self.bytes_mut(self.entry_offset(ids[i]), sector_size) };
            drive.read_sector(start + i as u32, buf)
        })
    }

    /// 把一组连续扇区写入驱动，`ids[i]` 写到扇区 `start + i`
    ///
    /// # Safety
    ///
    /// 同 [`Self::bytes`]，对 `ids` 中的每一项成立。
    pub unsafe fn store_run(
        &self,
        drive: &dyn MediaDrive,
        start: u32,
        ids: &[EntryId],
        sector_size: usize,
    ) -> Result<()> {
        transaction(drive, start, ids.len(), false, |i| {
            // SAFETY: 由调用者保证没有写者
            let buf = unsafe { self.bytes(self.entry_offset(ids[i]), sector_size) };
            drive.write_sector(start + i as u32, buf)
        })
    }
}

impl core::fmt::Debug for SectorStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SectorStorage")
            .field("len", &self.cells.len())
            .field("entry_size", &self.entry_size)
            .finish()
    }
}

/// 单扇区直接传输；多扇区时包在一个多扇区事务中
///
/// 中途失败仍会提交事务，返回第一个错误。
fn transaction<F>(drive: &dyn MediaDrive, start: u32, count: usize, is_read: bool, mut each: F) -> Result<()>
where
    F: FnMut(usize) -> Result<()>,
{
    let batched = count > 1;
    if batched {
        drive.open_multisector_transaction(start, count as u32, is_read)?;
    }

    let mut result = Ok(());
    for i in 0..count {
        if let Err(err) = each(i) {
            result = Err(err);
            break;
        }
    }

    if batched {
        let commit = drive.commit_multisector_transaction();
        if result.is_ok() {
            result = commit;
        }
    }
    result
}
