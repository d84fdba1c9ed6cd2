//! 驱动接口与几何参数

use crate::error::{Error, ErrorKind, Result};

/// 驱动标签
///
/// 在 64 位索引键中占据高位，扇区号占据低 32 位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DriveTag(pub u8);

impl core::fmt::Display for DriveTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "drive{}", self.0)
    }
}

/// 物理驱动接口
///
/// 实现此 trait 以提供底层介质访问。缓存在调用这些方法时**不持有**上下文锁，
/// 因此不同线程可能同时对同一驱动发起 I/O，驱动需要自行串行化。
///
/// 多扇区事务：缓存先调用 `open_multisector_transaction`，然后按扇区顺序
/// 调用 `count` 次 `read_sector`/`write_sector`，最后调用
/// `commit_multisector_transaction`。
///
/// # 示例
///
/// ```rust,ignore
/// use media_cache_core::{MediaDrive, Result};
///
/// struct NandDrive { /* ... */ }
///
/// impl MediaDrive for NandDrive {
///     fn native_sector_size(&self) -> u32 { 2048 }
///     fn nominal_sector_size(&self) -> u32 { 512 }
///     fn total_native_sectors(&self) -> u32 { 65536 }
///
///     fn read_sector(&self, sector: u32, buf: &mut [u8]) -> Result<()> {
///         // 读取一个原生扇区
///         Ok(())
///     }
///
///     fn write_sector(&self, sector: u32, buf: &[u8]) -> Result<()> {
///         // 写入一个原生扇区
///         Ok(())
///     }
/// }
/// ```
pub trait MediaDrive: Send + Sync {
    /// 原生扇区大小（字节）
    fn native_sector_size(&self) -> u32;

    /// 名义扇区大小（字节），默认等于原生扇区大小
    fn nominal_sector_size(&self) -> u32 {
        self.native_sector_size()
    }

    /// 原生扇区总数
    fn total_native_sectors(&self) -> u32;

    /// 最优传输扇区数（plane 数）
    fn optimal_transfer_sectors(&self) -> u32 {
        1
    }

    /// 分区起始偏移（名义扇区）
    fn partition_start(&self) -> u32 {
        0
    }

    /// 读取一个原生扇区到 `buf`（长度等于原生扇区大小）
    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> Result<()>;

    /// 从 `buf` 写入一个原生扇区
    fn write_sector(&self, sector: u32, buf: &[u8]) -> Result<()>;

    /// 打开多扇区事务
    fn open_multisector_transaction(&self, _start: u32, _count: u32, _is_read: bool) -> Result<()> {
        Ok(())
    }

    /// 提交多扇区事务
    fn commit_multisector_transaction(&self) -> Result<()> {
        Ok(())
    }

    /// 刷新驱动内部缓存
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// 擦除整个驱动
    fn erase(&self) -> Result<()> {
        Ok(())
    }
}

/// 驱动几何参数
///
/// 在注册时从 [`MediaDrive`] 读取一次并校验。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveGeometry {
    /// 原生扇区大小（字节）
    pub native_sector_size: u32,
    /// 名义扇区大小（字节）
    pub nominal_sector_size: u32,
    /// 原生扇区 = 2^shift 个名义扇区
    pub shift: u32,
    /// 原生扇区总数
    pub total_native_sectors: u32,
    /// 每次多扇区事务的 plane 数（至少为 1）
    pub plane_count: u32,
    /// 分区起始偏移（名义扇区）
    pub partition_start: u32,
}

impl DriveGeometry {
    /// 读取并校验驱动几何参数
    ///
    /// # 错误
    ///
    /// - 扇区大小为 0、原生扇区不是名义扇区的 2 的幂倍数 → `InvalidDriveDescriptor`
    /// - 原生扇区大于缓存项缓冲区 → `InvalidDriveDescriptor`
    pub fn probe(drive: &dyn MediaDrive, max_sector_size: usize) -> Result<Self> {
        let native = drive.native_sector_size();
        let nominal = drive.nominal_sector_size();

        if native == 0 || nominal == 0 || native % nominal != 0 {
            return Err(Error::new(
                ErrorKind::InvalidDriveDescriptor,
                "native sector size must be a multiple of the nominal sector size",
            ));
        }

        let ratio = native / nominal;
        if !ratio.is_power_of_two() {
            return Err(Error::new(
                ErrorKind::InvalidDriveDescriptor,
                "native/nominal sector ratio must be a power of two",
            ));
        }

        if native as usize > max_sector_size {
            return Err(Error::new(
                ErrorKind::InvalidDriveDescriptor,
                "native sector size exceeds cache entry size",
            ));
        }

        Ok(Self {
            native_sector_size: native,
            nominal_sector_size: nominal,
            shift: ratio.trailing_zeros(),
            total_native_sectors: drive.total_native_sectors(),
            plane_count: drive.optimal_transfer_sectors().max(1),
            partition_start: drive.partition_start(),
        })
    }

    /// 每个原生扇区包含的名义扇区数
    pub fn nominal_per_native(&self) -> u32 {
        1 << self.shift
    }

    /// 名义扇区总数
    pub fn total_nominal_sectors(&self) -> u64 {
        (self.total_native_sectors as u64) << self.shift
    }
}
