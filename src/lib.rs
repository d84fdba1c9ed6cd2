//! media_cache_core: 嵌入式闪存存储栈的扇区级媒体缓存
//!
//! 位于块设备/文件系统层与物理驱动之间，以原生扇区为单位缓冲数据：
//! - **有序扇区索引**与**加权 LRU** 驱逐
//! - **引用计数**的并发所有权（多个读者，或一个未决写者）
//! - **pinned write**：调用者直接写入缓存缓冲区，释放时才提交
//! - **链式扩展**：一次命中扩展为一段物理上连续的缓存项
//!
//! # 示例
//!
//! ```rust,ignore
//! use media_cache_core::{CacheConfig, DriveTag, MediaCache, RamDrive, SectorRequest, Result};
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let cache = MediaCache::new(CacheConfig::default());
//!     cache.register_drive(DriveTag(0), Arc::new(RamDrive::new(512, 4096)))?;
//!     cache.init(vec![0u8; 128 * 512])?;
//!
//!     // 读取扇区
//!     let req = SectorRequest::new(DriveTag(0), 42);
//!     let read = cache.read(&req)?;
//!     let first = read.data()[0];
//!     read.release()?;
//!
//!     cache.shutdown()
//! }
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`consts`] - 常量定义
//! - [`drive`] - 物理驱动接口与内存驱动
//! - [`cache`] - 扇区缓存

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 常量定义
pub mod consts;

/// 物理驱动抽象
pub mod drive;

/// 扇区缓存
pub mod cache;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 驱动
pub use drive::{DriveGeometry, DriveTag, MediaDrive, RamDrive};

// 缓存
pub use cache::{
    CacheConfig, CacheRead, CacheStats, MediaCache, PinnedWrite, RequestFlags, SectorRequest, Token, Weight,
};
