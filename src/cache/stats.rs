//! 缓存统计信息

/// 缓存统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// 读请求次数
    pub reads: u64,
    /// 写请求次数
    pub writes: u64,
    /// pinned write 请求次数
    pub pinned_writes: u64,
    /// 缓存命中次数
    pub hits: u64,
    /// 缓存未命中次数
    pub misses: u64,
    /// 被驱逐的有效缓存项数
    pub evictions: u64,
    /// 刷新写回的缓存项数
    pub flushes: u64,
    /// 设备扇区读取次数
    pub device_reads: u64,
    /// 设备扇区写入次数
    pub device_writes: u64,
    /// 链式附加的缓存项数
    pub chained_entries: u64,
    /// 等待超时次数
    pub timeouts: u64,
}

impl CacheStats {
    /// 计算命中率
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
