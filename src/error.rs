//! 错误类型定义
//!
//! 提供扇区缓存操作的错误类型。驱动层返回的错误原样向上传递。

use core::fmt;

/// 缓存操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 未注册的驱动标签
    InvalidDriveTag,
    /// 驱动描述（几何参数）无效
    InvalidDriveDescriptor,
    /// 扇区号超出驱动范围
    SectorOutOfBounds,
    /// 缓存底层存储太小或未对齐
    InvalidBuffer,
    /// 有界等待超时
    Timeout,
    /// 设备 I/O 失败
    Io,
    /// 内存不足
    OutOfMemory,
    /// 无效参数
    InvalidInput,
    /// 无效状态（未初始化、令牌已释放等）
    InvalidState,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// 是否为超时错误
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
