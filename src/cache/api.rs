//! 媒体缓存公共接口
//!
//! 每个请求的流程：校验参数 → 加锁 → 地址转换 → 查索引 →
//! （命中：持有并等待写者完成 / 未命中：未命中处理）→ 链式扩展 →
//! 更新权重和 LRU 位置提示 → 解锁 → 返回缓冲区句柄。

use super::chain::{extend_chain, ChainMode};
use super::config::CacheConfig;
use super::context::{Arena, CacheContext, ContextGuard, DriveSlot};
use super::entry::{EntryId, EntryWait};
use super::flush::{flush_all, flush_drive, flush_sector, FlushMode};
use super::handle::{CacheRead, PinnedWrite, Span};
use super::miss::resolve_miss;
use super::request::{RequestFlags, SectorAddress, SectorRequest};
use super::stats::CacheStats;
use super::token::Token;
use crate::drive::{DriveGeometry, DriveTag, MediaDrive};
use crate::error::{Error, ErrorKind, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// 已取得的首项
struct Resolved {
    first: EntryId,
    addr: SectorAddress,
    slot: DriveSlot,
}

/// 扇区级媒体缓存
///
/// # 示例
///
/// ```rust,ignore
/// use media_cache_core::{CacheConfig, DriveTag, MediaCache, RamDrive, SectorRequest};
/// use std::sync::Arc;
///
/// let cache = MediaCache::new(CacheConfig::default());
/// cache.register_drive(DriveTag(0), Arc::new(RamDrive::new(512, 1024)))?;
/// cache.init(vec![0u8; 64 * 512])?;
///
/// let req = SectorRequest::new(DriveTag(0), 10);
/// cache.write(&req, 0, &[0xAB; 512])?;
///
/// let read = cache.read(&req)?;
/// assert_eq!(read.data()[0], 0xAB);
/// read.release()?;
///
/// cache.shutdown()?;
/// ```
pub struct MediaCache {
    ctx: CacheContext,
}

impl MediaCache {
    /// 创建未初始化的缓存
    pub fn new(config: CacheConfig) -> Self {
        Self {
            ctx: CacheContext::new(config),
        }
    }

    /// 配置
    pub fn config(&self) -> &CacheConfig {
        self.ctx.config()
    }

    // ===== 生命周期 =====

    /// 用调用者提供的缓冲区初始化缓存项数组
    ///
    /// 已初始化时直接返回成功。
    pub fn init(&self, buffer: Vec<u8>) -> Result<()> {
        let mut g = self.ctx.lock();
        if g.arena.is_some() {
            log::debug!("[CACHE] init: already initialized");
            return Ok(());
        }
        let arena = Arena::new(buffer, self.ctx.config())?;
        log::debug!(
            "[CACHE] init: {} entries of {} bytes",
            arena.len(),
            arena.entry_size()
        );
        g.arena = Some(arena);
        Ok(())
    }

    /// 等待所有缓存项被释放，写回脏数据，然后释放缓存项数组
    ///
    /// 超时或写回失败时缓存保持可用并返回错误。
    pub fn shutdown(&self) -> Result<()> {
        let mut g = self.ctx.lock();
        if g.arena.is_none() {
            return Ok(());
        }

        g.closing = true;
        if let Err(err) = Self::drain(&mut g) {
            g.closing = false;
            g.notify();
            log::warn!("[CACHE] shutdown aborted: {}", err);
            return Err(err);
        }

        g.arena = None;
        g.closing = false;
        g.notify();
        log::debug!("[CACHE] shutdown complete");
        Ok(())
    }

    fn drain(g: &mut ContextGuard<'_>) -> Result<()> {
        let deadline = g.deadline();
        loop {
            let arena = g.arena()?;
            let busy = arena.entries.iter().any(|e| e.refcount() != 0) || arena.index.reserved_count() > 0;
            if !busy {
                break;
            }
            g.wait_for_change(deadline)?;
        }
        g.nested(|g| flush_all(g, FlushMode::INVALIDATE))?;
        Ok(())
    }

    /// 是否已初始化
    pub fn is_initialized(&self) -> bool {
        self.ctx.lock().arena.is_some()
    }

    /// 缓存项数（未初始化时为 0）
    pub fn entry_count(&self) -> usize {
        self.ctx.lock().arena.as_ref().map_or(0, |arena| arena.len())
    }

    // ===== 驱动 =====

    /// 注册驱动，返回校验后的几何参数
    ///
    /// 同一标签重复注册时，只有该驱动没有缓存扇区才会替换。
    pub fn register_drive(&self, tag: DriveTag, drive: Arc<dyn MediaDrive>) -> Result<DriveGeometry> {
        let geometry = DriveGeometry::probe(drive.as_ref(), self.ctx.config().max_sector_size)?;

        let mut g = self.ctx.lock();
        let cached = g
            .arena
            .as_ref()
            .map_or(false, |arena| arena.index.sectors_of(tag).next().is_some());
        if cached {
            return Err(Error::new(ErrorKind::InvalidState, "drive still has cached sectors"));
        }

        g.drives.insert(tag, DriveSlot { tag, drive, geometry });
        log::debug!(
            "[CACHE] registered {}: {} native sectors of {} bytes, nominal {} bytes, {} planes",
            tag,
            geometry.total_native_sectors,
            geometry.native_sector_size,
            geometry.nominal_sector_size,
            geometry.plane_count
        );
        Ok(geometry)
    }

    /// 写回并失效驱动的全部缓存项，然后注销
    pub fn unregister_drive(&self, tag: DriveTag) -> Result<()> {
        let mut g = self.ctx.lock();
        let slot = g.drive(tag)?;
        if g.arena.is_some() {
            g.nested(|g| flush_drive(g, &slot, FlushMode::INVALIDATE))?;
        }
        g.drives.remove(&tag);
        log::debug!("[CACHE] unregistered {}", tag);
        Ok(())
    }

    /// 丢弃驱动的全部缓存项（不写回），然后擦除驱动
    pub fn erase_drive(&self, tag: DriveTag) -> Result<()> {
        let mut g = self.ctx.lock();
        let slot = g.drive(tag)?;
        if g.arena.is_some() {
            g.nested(|g| flush_drive(g, &slot, FlushMode::DISCARD))?;
        }
        let drive = slot.drive.clone();
        g.unlocked(|| drive.erase())?;
        log::debug!("[CACHE] erased {}", tag);
        Ok(())
    }

    /// 驱动几何参数
    pub fn geometry(&self, tag: DriveTag) -> Result<DriveGeometry> {
        Ok(self.ctx.lock().drive(tag)?.geometry)
    }

    // ===== 请求 =====

    /// 读取扇区
    ///
    /// 返回的句柄覆盖首个扇区，必要时再链接后续原生扇区，
    /// 总扇区数不超过请求的扇区数。
    pub fn read(&self, req: &SectorRequest) -> Result<CacheRead<'_>> {
        let mut g = self.ctx.lock();
        g.stats.reads += 1;

        let load = !req.flags.contains(RequestFlags::NO_READBACK);
        let resolved = Self::acquire(&mut g, req, Access::Read, load)?;

        let room = resolved.addr.chain_room(&resolved.slot.geometry, req);
        let extra = match extend_chain(&mut g, &resolved.slot, resolved.first, room, ChainMode::Read { load }) {
            Ok(extra) => extra,
            Err(err) => {
                g.release_entries([resolved.first]);
                return Err(err);
            }
        };

        let token = Token::new(resolved.first, extra as u8);
        Self::stamp(g.arena_mut()?, token, req);
        let span = Self::span(&g, &resolved, req, extra)?;
        Ok(CacheRead::new(self, token, span))
    }

    /// 把 `data` 写入请求的首个原生扇区，从 `offset` 字节（相对请求扇区）开始
    ///
    /// 返回实际写入的字节数，不会越过原生扇区末尾。整扇区写入和
    /// `NO_READBACK` 不会先从介质载入。
    pub fn write(&self, req: &SectorRequest, offset: usize, data: &[u8]) -> Result<usize> {
        let mut g = self.ctx.lock();
        g.stats.writes += 1;

        if data.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "nothing to write"));
        }
        let slot = Self::open(&g, req.drive)?;
        let addr = SectorAddress::translate(&slot.geometry, req)?;
        let native = slot.geometry.native_sector_size as usize;
        let start = addr
            .sub_offset
            .checked_add(offset)
            .filter(|start| *start < native)
            .ok_or(Error::new(ErrorKind::InvalidInput, "write offset beyond native sector"))?;
        let len = data.len().min(native - start);
        let full = start == 0 && len == native;
        let load = !(full || req.flags.contains(RequestFlags::NO_READBACK));

        let resolved = Self::acquire(&mut g, req, Access::Write, load)?;
        let first = resolved.first;
        {
            let arena = g.arena_mut()?;
            // SAFETY: 刚以唯一持有者身份取得，且在锁内拷贝
            let buf = unsafe { arena.storage.bytes_mut(arena.storage.entry_offset(first) + start, len) };
            buf.copy_from_slice(&data[..len]);
            let entry = arena.entry_mut(first);
            entry.mark_valid();
            entry.mark_dirty();
            Self::stamp(arena, Token::new(first, 0), req);
        }

        if req.flags.contains(RequestFlags::WRITE_THROUGH) {
            let result = g.store_entries(&resolved.slot, &[first]);
            if result.is_ok() {
                g.arena_mut()?.entry_mut(first).mark_clean();
            }
            g.release_entries([first]);
            result?;
        } else {
            g.release_entries([first]);
        }
        Ok(len)
    }

    /// 取得可直接写入的缓冲区
    ///
    /// 缓存项在释放句柄时才标记为脏；`WRITE_THROUGH` 时在释放时写入介质。
    /// `SEQUENTIAL_WRITE` 表示调用者会完整覆盖链式扇区，链式项不回读。
    pub fn pinned_write(&self, req: &SectorRequest) -> Result<PinnedWrite<'_>> {
        let mut g = self.ctx.lock();
        g.stats.pinned_writes += 1;

        let through = req.flags.contains(RequestFlags::WRITE_THROUGH);
        let no_readback = req.flags.contains(RequestFlags::NO_READBACK);
        let resolved = Self::acquire(&mut g, req, Access::Write, !no_readback)?;
        g.arena_mut()?.entry_mut(resolved.first).begin_write(through);

        let room = resolved.addr.chain_room(&resolved.slot.geometry, req);
        let mode = ChainMode::Write {
            load: !(no_readback || req.flags.contains(RequestFlags::SEQUENTIAL_WRITE)),
            write_through: through,
        };
        let extra = match extend_chain(&mut g, &resolved.slot, resolved.first, room, mode) {
            Ok(extra) => extra,
            Err(err) => {
                g.arena_mut()?.entry_mut(resolved.first).abandon_write();
                g.release_entries([resolved.first]);
                return Err(err);
            }
        };

        let token = Token::new(resolved.first, extra as u8);
        Self::stamp(g.arena_mut()?, token, req);
        let span = Self::span(&g, &resolved, req, extra)?;
        Ok(PinnedWrite::new(self, token, span))
    }

    /// 释放令牌
    ///
    /// 按数组顺序处理令牌覆盖的每个缓存项：完成未决的 pinned write
    /// （需要时写穿到介质），释放持有，无人持有时插回驱逐列表。
    ///
    /// 签名不匹配的值不是令牌，直接忽略。令牌已释放时返回 `InvalidState`，不做任何修改。
    ///
    /// # Safety
    ///
    /// 令牌必须来自 [`CacheRead::into_token`] 或 [`PinnedWrite::into_token`]，
    /// 且只能释放一次。释放之后之前句柄给出的缓冲区不能再访问。
    pub unsafe fn release(&self, token: Token) -> Result<()> {
        if !token.is_valid() {
            log::trace!("[CACHE] ignoring non-token {}", token);
            return Ok(());
        }

        let mut g = self.ctx.lock();
        let through = {
            let arena = g.arena_mut()?;
            if token.first() as usize + token.entry_count() > arena.len() {
                return Err(Error::new(ErrorKind::InvalidInput, "token outside the entry arena"));
            }
            if token.entries().any(|id| arena.entry(id).refcount() == 0) {
                log::warn!("[CACHE] token {} already released", token);
                return Err(Error::new(ErrorKind::InvalidState, "token already released"));
            }

            let mut through = Vec::new();
            for id in token.entries() {
                let entry = arena.entry_mut(id);
                if entry.is_write_pending() {
                    if entry.is_write_through() {
                        through.push(id);
                    }
                    entry.finish_write();
                }
            }
            through
        };

        let mut result = Ok(());
        if let Some(&head) = through.first() {
            let tag = g.arena()?.entry(head).drive;
            result = g.drive(tag).and_then(|slot| g.store_entries(&slot, &through));
            if result.is_ok() {
                let arena = g.arena_mut()?;
                for &id in &through {
                    arena.entry_mut(id).mark_clean();
                }
            }
        }

        g.release_entries(token.entries());
        result
    }

    /// 刷新
    ///
    /// `FLUSH_ALL_DRIVES` 刷新所有驱动后再调用每个驱动的 flush；
    /// `FLUSH_DRIVE` 刷新请求的驱动；否则只刷新请求的扇区。
    /// `INVALIDATE` 写回后失效，`REMOVE_ENTRY` 不写回直接失效。
    ///
    /// 返回写回介质的缓存项数。
    pub fn flush(&self, req: &SectorRequest) -> Result<usize> {
        let mut g = self.ctx.lock();
        g.arena()?;
        let mode = FlushMode::from_flags(req.flags);

        if req.flags.contains(RequestFlags::FLUSH_ALL_DRIVES) {
            return flush_all(&mut g, mode);
        }
        let slot = g.drive(req.drive)?;
        if req.flags.contains(RequestFlags::FLUSH_DRIVE) {
            return flush_drive(&mut g, &slot, mode);
        }
        let addr = SectorAddress::translate(&slot.geometry, req)?;
        Ok(flush_sector(&mut g, &slot, addr.native, mode)? as usize)
    }

    // ===== 统计与诊断 =====

    /// 统计信息快照
    pub fn stats(&self) -> CacheStats {
        self.ctx.lock().stats
    }

    /// 清零统计信息
    pub fn reset_stats(&self) {
        self.ctx.lock().stats = CacheStats::default();
    }

    /// 某个驱动当前缓存的原生扇区（升序）
    pub fn cached_sectors(&self, drive: DriveTag) -> Vec<u32> {
        let g = self.ctx.lock();
        match g.arena() {
            Ok(arena) => arena.index.sectors_of(drive).map(|(sector, _)| sector).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// 检查缓存项数组、索引和驱逐列表之间的不变量
    pub fn check_invariants(&self) -> Result<()> {
        let g = self.ctx.lock();
        g.arena()?
            .check()
            .map_err(|msg| Error::new(ErrorKind::InvalidState, msg))
    }

    // ===== 内部 =====

    fn open(g: &ContextGuard<'_>, tag: DriveTag) -> Result<DriveSlot> {
        if g.closing {
            return Err(Error::new(ErrorKind::InvalidState, "media cache is shutting down"));
        }
        g.arena()?;
        g.drive(tag)
    }

    /// 取得请求的首个原生扇区
    ///
    /// 读者命中时先持有再等写者完成，避免等待期间被驱逐；
    /// 写者命中时等到无人持有再持有，期间被驱逐则重新查找。
    fn acquire(g: &mut ContextGuard<'_>, req: &SectorRequest, access: Access, load: bool) -> Result<Resolved> {
        let slot = Self::open(g, req.drive)?;
        let addr = SectorAddress::translate(&slot.geometry, req)?;
        let tag = slot.tag;
        let deadline = g.deadline();

        loop {
            let arena = g.arena_mut()?;
            match arena.index.lookup(tag, addr.native) {
                Some(id) if access == Access::Read => {
                    arena.claim(id);
                    if let Err(err) = g.wait_entry(id, EntryWait::WriteComplete, deadline) {
                        g.release_entries([id]);
                        return Err(err);
                    }
                    g.stats.hits += 1;
                    log::trace!("[CACHE] hit {}:{} -> entry {}", tag, addr.native, id);
                    return Ok(Resolved { first: id, addr, slot });
                }
                Some(id) => {
                    if arena.entry(id).refcount() == 0 {
                        arena.claim(id);
                        g.stats.hits += 1;
                        log::trace!("[CACHE] hit {}:{} -> entry {} (write)", tag, addr.native, id);
                        return Ok(Resolved { first: id, addr, slot });
                    }
                }
                None if arena.index.is_reserved(tag, addr.native) => {}
                None => {
                    g.stats.misses += 1;
                    let first = resolve_miss(g, &slot, addr.native, load)?;
                    return Ok(Resolved { first, addr, slot });
                }
            }
            g.wait_for_change(deadline)?;
        }
    }

    /// 写入权重和 LRU 位置提示
    fn stamp(arena: &mut Arena, token: Token, req: &SectorRequest) {
        let bypass = req.flags.contains(RequestFlags::BYPASS_CACHE);
        for id in token.entries() {
            let entry = arena.entry_mut(id);
            if req.flags.contains(RequestFlags::APPLY_WEIGHT) {
                entry.weight = req.weight;
            }
            entry.set_insert_on_lru(bypass);
        }
    }

    fn span(g: &ContextGuard<'_>, resolved: &Resolved, req: &SectorRequest, extra: usize) -> Result<Span> {
        let storage = g.arena()?.storage.clone();
        let geometry = &resolved.slot.geometry;
        Ok(Span {
            offset: storage.entry_offset(resolved.first) + resolved.addr.sub_offset,
            len: resolved.addr.byte_len(geometry, req, extra),
            sub_offset: resolved.addr.sub_offset,
            sectors: resolved.addr.total_sectors(geometry, req, extra),
            storage,
        })
    }
}

impl core::fmt::Debug for MediaCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let g = self.ctx.lock();
        f.debug_struct("MediaCache")
            .field("entries", &g.arena.as_ref().map_or(0, |arena| arena.len()))
            .field("drives", &g.drives.len())
            .field("stats", &g.stats)
            .finish()
    }
}
