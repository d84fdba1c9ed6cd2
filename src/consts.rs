//! 扇区缓存常量定义

use core::time::Duration;

//=============================================================================
// 令牌
//=============================================================================

/// 令牌签名字节（bits 31..24）
pub const TOKEN_SIGNATURE: u8 = 0xA5;

/// 令牌中签名字段的位移
pub const TOKEN_SIGNATURE_SHIFT: u32 = 24;

/// 令牌中链长度字段的位移
pub const TOKEN_CHAIN_SHIFT: u32 = 16;

/// 每个令牌最多覆盖的缓存项（首项 + 255 个链式项）
pub const MAX_TOKEN_ENTRIES: usize = 256;

/// 缓存项数组上限（令牌索引字段为 16 位）
pub const MAX_ARENA_ENTRIES: usize = u16::MAX as usize;

//=============================================================================
// 等待
//=============================================================================

/// 写完成 / 引用计数等待的上限（2,000,000 µs）
pub const WAIT_TIMEOUT: Duration = Duration::from_micros(2_000_000);

/// 调度 tick，用于无界重试的休眠粒度
pub const SCHEDULER_TICK: Duration = Duration::from_millis(1);

//=============================================================================
// 默认配置
//=============================================================================

/// 默认最大扇区大小（每个缓存项的缓冲区大小）
pub const DEFAULT_MAX_SECTOR_SIZE: usize = 512;

/// 默认最大链长度（缓存项数）
pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 8;

/// 默认加权 LRU 窗口（0 表示关闭加权）
pub const DEFAULT_LRU_WINDOW: usize = 0;

/// drive 标签在 64 位索引键中的位移
pub const DRIVE_KEY_SHIFT: u32 = 32;
