//! 缓冲区句柄
//!
//! [`CacheRead`] 和 [`PinnedWrite`] 把 "缓冲区指针 + 令牌" 包装成借用 [`MediaCache`]
//! 的句柄。句柄存活期间它覆盖的缓存项一直被持有，drop 时自动释放；
//! 需要跨越句柄生命周期传递时用 `into_token()` 取出原始令牌，交给
//! [`MediaCache::release`]。

use super::api::MediaCache;
use super::storage::SectorStorage;
use super::token::Token;
use crate::error::Result;
use alloc::sync::Arc;

/// 句柄覆盖的存储范围
pub(crate) struct Span {
    pub storage: Arc<SectorStorage>,
    pub offset: usize,
    pub len: usize,
    pub sub_offset: usize,
    pub sectors: u32,
}

/// 读取句柄
pub struct CacheRead<'a> {
    cache: &'a MediaCache,
    token: Token,
    span: Span,
    released: bool,
}

impl<'a> CacheRead<'a> {
    pub(crate) fn new(cache: &'a MediaCache, token: Token, span: Span) -> Self {
        Self {
            cache,
            token,
            span,
            released: false,
        }
    }

    /// 缓存数据，从请求的第一个扇区开始
    pub fn data(&self) -> &[u8] {
        // SAFETY: 句柄持有覆盖这段字节的全部缓存项，写者要等它们无人持有
        unsafe { self.span.storage.bytes(self.span.offset, self.span.len) }
    }

    /// 实际返回的扇区数（请求单位）
    pub fn sector_count(&self) -> u32 {
        self.span.sectors
    }

    /// 首个扇区在原生扇区内的字节偏移
    pub fn sub_offset(&self) -> usize {
        self.span.sub_offset
    }

    /// 令牌
    pub fn token(&self) -> Token {
        self.token
    }

    /// 释放
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        // SAFETY: 令牌来自本句柄，句柄随之失效
        unsafe { self.cache.release(self.token) }
    }

    /// 放弃句柄，交出令牌
    ///
    /// 调用者之后必须用 [`MediaCache::release`] 释放它，且只能释放一次。
    pub fn into_token(mut self) -> Token {
        self.released = true;
        self.token
    }
}

impl Drop for CacheRead<'_> {
    fn drop(&mut self) {
        if !self.released {
            // SAFETY: 令牌来自本句柄，尚未释放
            if let Err(err) = unsafe { self.cache.release(self.token) } {
                log::warn!("[CACHE] release of {} on drop failed: {}", self.token, err);
            }
        }
    }
}

impl core::fmt::Debug for CacheRead<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheRead")
            .field("token", &self.token)
            .field("len", &self.span.len)
            .field("sectors", &self.span.sectors)
            .finish()
    }
}

/// pinned write 句柄
///
/// 写入直接进入缓存缓冲区；释放时缓存项才标记为脏，需要写穿的在此时写入介质。
pub struct PinnedWrite<'a> {
    cache: &'a MediaCache,
    token: Token,
    span: Span,
    released: bool,
}

impl<'a> PinnedWrite<'a> {
    pub(crate) fn new(cache: &'a MediaCache, token: Token, span: Span) -> Self {
        Self {
            cache,
            token,
            span,
            released: false,
        }
    }

    /// 当前缓冲区内容
    pub fn data(&self) -> &[u8] {
        // SAFETY: 句柄是这些缓存项唯一的写者，读者要等写入完成
        unsafe { self.span.storage.bytes(self.span.offset, self.span.len) }
    }

    /// 可写缓冲区
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: 同上，`&mut self` 保证句柄内没有其他借用
        unsafe { self.span.storage.bytes_mut(self.span.offset, self.span.len) }
    }

    /// 实际覆盖的扇区数（请求单位）
    pub fn sector_count(&self) -> u32 {
        self.span.sectors
    }

    /// 首个扇区在原生扇区内的字节偏移
    pub fn sub_offset(&self) -> usize {
        self.span.sub_offset
    }

    /// 令牌
    pub fn token(&self) -> Token {
        self.token
    }

    /// 完成写入并释放
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        // SAFETY: 令牌来自本句柄，句柄随之失效
        unsafe { self.cache.release(self.token) }
    }

    /// 放弃句柄，交出令牌
    ///
    /// 调用者之后必须用 [`MediaCache::release`] 释放它，且只能释放一次；
    /// 在那之前不能再访问缓冲区。
    pub fn into_token(mut self) -> Token {
        self.released = true;
        self.token
    }
}

impl Drop for PinnedWrite<'_> {
    fn drop(&mut self) {
        if !self.released {
            // SAFETY: 令牌来自本句柄，尚未释放
            if let Err(err) = unsafe { self.cache.release(self.token) } {
                log::warn!("[CACHE] release of {} on drop failed: {}", self.token, err);
            }
        }
    }
}

impl core::fmt::Debug for PinnedWrite<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PinnedWrite")
            .field("token", &self.token)
            .field("len", &self.span.len)
            .field("sectors", &self.span.sectors)
            .finish()
    }
}
