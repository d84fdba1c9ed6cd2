//! 缓存配置

use crate::consts::*;
use core::time::Duration;

/// 缓存配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// 每个缓存项的缓冲区大小，也是可注册驱动的最大原生扇区
    pub max_sector_size: usize,
    /// 每个令牌最多覆盖的缓存项数（首项 + 链式项）
    pub max_chain_length: usize,
    /// 加权 LRU 窗口，0 关闭加权
    pub lru_window: usize,
    /// 有界等待的上限
    pub wait_timeout: Duration,
    /// 无界重试的休眠粒度
    pub tick: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_sector_size: DEFAULT_MAX_SECTOR_SIZE,
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
            lru_window: DEFAULT_LRU_WINDOW,
            wait_timeout: WAIT_TIMEOUT,
            tick: SCHEDULER_TICK,
        }
    }
}

impl CacheConfig {
    /// 设置缓存项大小
    pub fn with_max_sector_size(mut self, size: usize) -> Self {
        self.max_sector_size = size;
        self
    }

    /// 设置最大链长度
    pub fn with_max_chain_length(mut self, len: usize) -> Self {
        self.max_chain_length = len;
        self
    }

    /// 设置加权窗口
    pub fn with_lru_window(mut self, window: usize) -> Self {
        self.lru_window = window;
        self
    }

    /// 设置等待上限
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// 实际使用的链长度，限制在 1..=256
    pub fn chain_limit(&self) -> usize {
        self.max_chain_length.clamp(1, MAX_TOKEN_ENTRIES)
    }
}
