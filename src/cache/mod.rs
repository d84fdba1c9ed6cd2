//! 扇区缓存模块
//!
//! 在块设备/文件系统层和物理驱动之间，以原生扇区为单位在内存中缓冲数据，
//! 吸收读写流量、合并多扇区传输、避免重复的设备 I/O。
//!
//! # 主要组件
//!
//! - [`CacheEntry`] - 单个缓存项，缓冲一个原生扇区
//! - [`SectorIndex`] - `(drive, sector)` 到缓存项的有序索引
//! - [`EvictionList`] - 无人持有缓存项的加权 LRU 列表（基于 lru crate）
//! - [`MediaCache`] - 公共接口：`read`、`write`、`pinned_write`、`release`、`flush`
//! - [`CacheRead`] / [`PinnedWrite`] - 缓冲区句柄，携带 [`Token`]
//!
//! # 所有权模型
//!
//! 每个缓存项有引用计数：
//!
//! - 多个读者可以同时持有同一缓存项
//! - 一个 pinned write 期间缓存项处于 `WRITE_PENDING`，读者持有后要等它完成
//! - 写者命中时要等缓存项无人持有
//! - 只有无人持有的缓存项在驱逐列表中，也只有它们会被驱逐或改挂
//!
//! 缓存元数据由一把上下文锁保护，设备 I/O 和等待期间锁被完全释放。
//!
//! # 使用示例
//!
//! ```rust,ignore
//! use media_cache_core::cache::{MediaCache, CacheConfig, SectorRequest, RequestFlags};
//!
//! let cache = MediaCache::new(CacheConfig::default());
//! cache.register_drive(DriveTag(0), drive)?;
//! cache.init(vec![0u8; 32 * 512])?;
//!
//! // 直接写入缓存缓冲区，释放时写穿
//! let req = SectorRequest::new(DriveTag(0), 100).with_flags(RequestFlags::WRITE_THROUGH);
//! let mut pinned = cache.pinned_write(&req)?;
//! pinned.data_mut().fill(0);
//! pinned.release()?;
//!
//! // 刷新整个驱动并失效
//! let req = SectorRequest::new(DriveTag(0), 0)
//!     .with_flags(RequestFlags::FLUSH_DRIVE | RequestFlags::INVALIDATE);
//! cache.flush(&req)?;
//! ```

mod api;
mod chain;
mod config;
mod context;
mod entry;
mod flush;
mod handle;
mod index;
mod lru;
mod miss;
mod request;
mod stats;
mod storage;
mod token;

pub use api::MediaCache;
pub use config::CacheConfig;
pub use entry::{CacheEntry, EntryFlags, EntryId, EntryWait, Weight};
pub use handle::{CacheRead, PinnedWrite};
pub use index::SectorIndex;
pub use lru::EvictionList;
pub use request::{RequestFlags, SectorAddress, SectorRequest};
pub use stats::CacheStats;
pub use storage::SectorStorage;
pub use token::Token;
