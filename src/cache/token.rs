//! 缓冲区令牌
//!
//! 32 位不透明值：
//!
//! ```text
//! 31        24 23        16 15                    0
//! +-----------+------------+-----------------------+
//! | signature | chain extra|   first entry index   |
//! +-----------+------------+-----------------------+
//! ```

use super::entry::EntryId;
use crate::consts::{TOKEN_CHAIN_SHIFT, TOKEN_SIGNATURE, TOKEN_SIGNATURE_SHIFT};

/// 缓冲区令牌
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u32);

impl Token {
    /// 由首项和链式附加项数构造
    pub fn new(first: EntryId, extra: u8) -> Self {
        Self(
            ((TOKEN_SIGNATURE as u32) << TOKEN_SIGNATURE_SHIFT)
                | ((extra as u32) << TOKEN_CHAIN_SHIFT)
                | first as u32,
        )
    }

    /// 从原始值恢复（不校验）
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// 原始值
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// 签名是否匹配
    pub const fn is_valid(&self) -> bool {
        (self.0 >> TOKEN_SIGNATURE_SHIFT) as u8 == TOKEN_SIGNATURE
    }

    /// 首项下标
    pub const fn first(&self) -> EntryId {
        self.0 as u16
    }

    /// 首项之后的链式项数
    pub const fn extra(&self) -> u8 {
        (self.0 >> TOKEN_CHAIN_SHIFT) as u8
    }

    /// 覆盖的缓存项总数
    pub const fn entry_count(&self) -> usize {
        self.extra() as usize + 1
    }

    /// 覆盖的缓存项下标（数组顺序）
    pub fn entries(&self) -> impl Iterator<Item = EntryId> {
        let first = self.first() as usize;
        (first..first + self.entry_count()).map(|id| id as EntryId)
    }
}

impl core::fmt::Display for Token {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
