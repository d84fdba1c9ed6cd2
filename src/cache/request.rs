//! 请求参数块与扇区地址转换

use super::entry::Weight;
use crate::drive::{DriveGeometry, DriveTag};
use crate::error::{Error, ErrorKind, Result};
use bitflags::bitflags;

bitflags! {
    /// 请求标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u32 {
        /// `sector` 是原生扇区号
        const USE_NATIVE_SECTORS = 0x0001;
        /// 不加分区起始偏移
        const NO_PARTITION_OFFSET = 0x0002;
        /// 把 `weight` 写入缓存项
        const APPLY_WEIGHT = 0x0004;
        /// 释放时放到 LRU 冷端
        const BYPASS_CACHE = 0x0008;
        /// 写入在完成时提交到介质
        const WRITE_THROUGH = 0x0010;
        /// 顺序写：链式项会被完整覆盖，不回读
        const SEQUENTIAL_WRITE = 0x0020;
        /// 未命中时不从介质载入
        const NO_READBACK = 0x0040;
        /// 刷新后使缓存项失效
        const INVALIDATE = 0x0080;
        /// 刷新整个驱动
        const FLUSH_DRIVE = 0x0100;
        /// 刷新所有驱动
        const FLUSH_ALL_DRIVES = 0x0200;
        /// 丢弃缓存项（不写回）
        const REMOVE_ENTRY = 0x0400;
    }
}

/// 请求参数块
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRequest {
    /// 驱动标签
    pub drive: DriveTag,
    /// 扇区号（名义或原生，取决于 `USE_NATIVE_SECTORS`）
    pub sector: u32,
    /// 请求的扇区数（0 按 1 处理）
    pub sector_count: u32,
    /// 请求标志
    pub flags: RequestFlags,
    /// 驱逐权重（配合 `APPLY_WEIGHT`）
    pub weight: Weight,
}

impl SectorRequest {
    /// 单扇区请求
    pub fn new(drive: DriveTag, sector: u32) -> Self {
        Self {
            drive,
            sector,
            sector_count: 1,
            flags: RequestFlags::empty(),
            weight: Weight::Low,
        }
    }

    /// 设置扇区数
    pub fn with_count(mut self, count: u32) -> Self {
        self.sector_count = count;
        self
    }

    /// 追加标志
    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// 设置权重并置位 `APPLY_WEIGHT`
    pub fn with_weight(mut self, weight: Weight) -> Self {
        self.weight = weight;
        self.flags |= RequestFlags::APPLY_WEIGHT;
        self
    }

    fn count(&self) -> u32 {
        self.sector_count.max(1)
    }
}

/// 转换后的地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorAddress {
    /// 原生扇区号
    pub native: u32,
    /// 在原生扇区内的字节偏移
    pub sub_offset: usize,
    /// 首个原生扇区可满足的请求扇区数
    pub sectors: u32,
}

impl SectorAddress {
    /// 转换请求地址
    ///
    /// 名义扇区：`native = (s + offset) >> k`，
    /// `sub_offset = ((s + offset) - (native << k)) * nominal_size`；
    /// 原生扇区：`native = s`，`sub_offset = 0`，`sectors = 1`。
    pub fn translate(geometry: &DriveGeometry, req: &SectorRequest) -> Result<Self> {
        if req.flags.contains(RequestFlags::USE_NATIVE_SECTORS) {
            if req.sector >= geometry.total_native_sectors {
                return Err(Error::new(
                    ErrorKind::SectorOutOfBounds,
                    "native sector beyond end of drive",
                ));
            }
            return Ok(Self {
                native: req.sector,
                sub_offset: 0,
                sectors: 1,
            });
        }

        let offset = if req.flags.contains(RequestFlags::NO_PARTITION_OFFSET) {
            0
        } else {
            geometry.partition_start as u64
        };
        let nominal = req.sector as u64 + offset;
        if nominal >= geometry.total_nominal_sectors() {
            return Err(Error::new(
                ErrorKind::SectorOutOfBounds,
                "nominal sector beyond end of drive",
            ));
        }

        let native = nominal >> geometry.shift;
        let sub_offset = ((nominal - (native << geometry.shift)) * geometry.nominal_sector_size as u64) as usize;
        let fit = (geometry.native_sector_size as usize - sub_offset) / geometry.nominal_sector_size as usize;

        Ok(Self {
            native: native as u32,
            sub_offset,
            sectors: req.count().min(fit as u32),
        })
    }

    /// 首项之后还可以链接的原生扇区数
    ///
    /// 所有权以原生扇区为单位，剩余的名义扇区向下取整到整原生扇区；
    /// 首项必须一直用到扇区末尾，链才连续。
    pub fn chain_room(&self, geometry: &DriveGeometry, req: &SectorRequest) -> usize {
        if req.flags.contains(RequestFlags::USE_NATIVE_SECTORS) {
            return (req.count() - 1) as usize;
        }
        let used = self.sub_offset + self.sectors as usize * geometry.nominal_sector_size as usize;
        if used != geometry.native_sector_size as usize {
            return 0;
        }
        ((req.count() - self.sectors) >> geometry.shift) as usize
    }

    /// 链接 `extra` 个原生扇区后的总扇区数（以请求单位计）
    pub fn total_sectors(&self, geometry: &DriveGeometry, req: &SectorRequest, extra: usize) -> u32 {
        if req.flags.contains(RequestFlags::USE_NATIVE_SECTORS) {
            1 + extra as u32
        } else {
            self.sectors + ((extra as u32) << geometry.shift)
        }
    }

    /// 返回给调用者的字节长度
    pub fn byte_len(&self, geometry: &DriveGeometry, req: &SectorRequest, extra: usize) -> usize {
        let unit = if req.flags.contains(RequestFlags::USE_NATIVE_SECTORS) {
            geometry.native_sector_size
        } else {
            geometry.nominal_sector_size
        };
        self.total_sectors(geometry, req, extra) as usize * unit as usize
    }
}
