//! 内存驱动
//!
//! 基于 `Vec<u8>` 的 [`MediaDrive`] 实现，记录 I/O 次数和多扇区事务，
//! 并支持按扇区注入读写失败。用于测试和无硬件时的调试。

use super::MediaDrive;
use crate::error::{Error, ErrorKind, Result};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use parking_lot::Mutex;

/// 一次多扇区事务的记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionRecord {
    /// 起始原生扇区
    pub start: u32,
    /// 扇区数
    pub count: u32,
    /// 是否为读事务
    pub is_read: bool,
}

/// 内存驱动
pub struct RamDrive {
    native_sector_size: u32,
    nominal_sector_size: u32,
    total_sectors: u32,
    planes: u32,
    partition_start: u32,
    io_delay: Option<Duration>,
    storage: Mutex<Vec<u8>>,
    failing_reads: Mutex<BTreeSet<u32>>,
    failing_writes: Mutex<BTreeSet<u32>>,
    transactions: Mutex<Vec<TransactionRecord>>,
    write_log: Mutex<Vec<u32>>,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    erases: AtomicU64,
}

impl RamDrive {
    /// 创建内存驱动（名义扇区 = 原生扇区，单 plane，无分区偏移）
    pub fn new(native_sector_size: u32, total_sectors: u32) -> Self {
        let len = native_sector_size as usize * total_sectors as usize;
        Self {
            native_sector_size,
            nominal_sector_size: native_sector_size,
            total_sectors,
            planes: 1,
            partition_start: 0,
            io_delay: None,
            storage: Mutex::new(alloc::vec![0u8; len]),
            failing_reads: Mutex::new(BTreeSet::new()),
            failing_writes: Mutex::new(BTreeSet::new()),
            transactions: Mutex::new(Vec::new()),
            write_log: Mutex::new(Vec::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            erases: AtomicU64::new(0),
        }
    }

    /// 设置名义扇区大小
    pub fn with_nominal_sector_size(mut self, size: u32) -> Self {
        self.nominal_sector_size = size;
        self
    }

    /// 设置 plane 数
    pub fn with_planes(mut self, planes: u32) -> Self {
        self.planes = planes;
        self
    }

    /// 设置分区起始偏移（名义扇区）
    pub fn with_partition_start(mut self, start: u32) -> Self {
        self.partition_start = start;
        self
    }

    /// 每次扇区 I/O 前休眠
    pub fn with_io_delay(mut self, delay: Duration) -> Self {
        self.io_delay = Some(delay);
        self
    }

    /// 读取某个原生扇区的当前介质内容
    pub fn sector_data(&self, sector: u32) -> Vec<u8> {
        let range = self.range(sector);
        self.storage.lock()[range].to_vec()
    }

    /// 直接改写介质内容（不经过缓存）
    pub fn set_sector_data(&self, sector: u32, data: &[u8]) {
        let range = self.range(sector);
        let mut storage = self.storage.lock();
        let len = data.len().min(range.len());
        storage[range.start..range.start + len].copy_from_slice(&data[..len]);
    }

    /// 让某个扇区的读取失败
    pub fn fail_reads_at(&self, sector: u32) {
        self.failing_reads.lock().insert(sector);
    }

    /// 让某个扇区的写入失败
    pub fn fail_writes_at(&self, sector: u32) {
        self.failing_writes.lock().insert(sector);
    }

    /// 清除所有注入的失败
    pub fn clear_faults(&self) {
        self.failing_reads.lock().clear();
        self.failing_writes.lock().clear();
    }

    /// 扇区读取次数
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// 扇区写入次数
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// 驱动刷新次数
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// 擦除次数
    pub fn erases(&self) -> u64 {
        self.erases.load(Ordering::SeqCst)
    }

    /// 已打开的多扇区事务
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.transactions.lock().clone()
    }

    /// 按顺序写入过的扇区号
    pub fn write_log(&self) -> Vec<u32> {
        self.write_log.lock().clone()
    }

    /// 清零所有计数和日志
    pub fn reset_counters(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
        self.flushes.store(0, Ordering::SeqCst);
        self.erases.store(0, Ordering::SeqCst);
        self.transactions.lock().clear();
        self.write_log.lock().clear();
    }

    fn range(&self, sector: u32) -> core::ops::Range<usize> {
        let size = self.native_sector_size as usize;
        let start = sector as usize * size;
        start..start + size
    }

    fn check_sector(&self, sector: u32) -> Result<()> {
        if sector >= self.total_sectors {
            return Err(Error::new(
                ErrorKind::SectorOutOfBounds,
                "ram drive sector out of range",
            ));
        }
        if let Some(delay) = self.io_delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }
}

impl MediaDrive for RamDrive {
    fn native_sector_size(&self) -> u32 {
        self.native_sector_size
    }

    fn nominal_sector_size(&self) -> u32 {
        self.nominal_sector_size
    }

    fn total_native_sectors(&self) -> u32 {
        self.total_sectors
    }

    fn optimal_transfer_sectors(&self) -> u32 {
        self.planes
    }

    fn partition_start(&self) -> u32 {
        self.partition_start
    }

    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> Result<()> {
        self.check_sector(sector)?;
        if self.failing_reads.lock().contains(&sector) {
            return Err(Error::new(ErrorKind::Io, "injected read failure"));
        }
        let range = self.range(sector);
        let len = range.len().min(buf.len());
        buf[..len].copy_from_slice(&self.storage.lock()[range.start..range.start + len]);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_sector(&self, sector: u32, buf: &[u8]) -> Result<()> {
        self.check_sector(sector)?;
        if self.failing_writes.lock().contains(&sector) {
            return Err(Error::new(ErrorKind::Io, "injected write failure"));
        }
        let range = self.range(sector);
        let len = range.len().min(buf.len());
        self.storage.lock()[range.start..range.start + len].copy_from_slice(&buf[..len]);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.write_log.lock().push(sector);
        Ok(())
    }

    fn open_multisector_transaction(&self, start: u32, count: u32, is_read: bool) -> Result<()> {
        self.transactions.lock().push(TransactionRecord { start, count, is_read });
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        self.storage.lock().fill(0xFF);
        self.erases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let drive = RamDrive::new(512, 4);
        let data = alloc::vec![0x5Au8; 512];
        drive.write_sector(2, &data).unwrap();

        let mut buf = alloc::vec![0u8; 512];
        drive.read_sector(2, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(drive.reads(), 1);
        assert_eq!(drive.writes(), 1);
        assert_eq!(drive.write_log(), alloc::vec![2]);
    }

    #[test]
    fn test_injected_failures() {
        let drive = RamDrive::new(512, 4);
        drive.fail_reads_at(1);
        drive.fail_writes_at(3);

        let mut buf = alloc::vec![0u8; 512];
        assert_eq!(drive.read_sector(1, &mut buf).unwrap_err().kind(), ErrorKind::Io);
        assert_eq!(drive.write_sector(3, &buf).unwrap_err().kind(), ErrorKind::Io);

        drive.clear_faults();
        drive.read_sector(1, &mut buf).unwrap();
        drive.write_sector(3, &buf).unwrap();
    }

    #[test]
    fn test_out_of_range_sector() {
        let drive = RamDrive::new(512, 4);
        let mut buf = alloc::vec![0u8; 512];
        let err = drive.read_sector(4, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SectorOutOfBounds);
    }

    #[test]
    fn test_erase_fills_ones() {
        let drive = RamDrive::new(512, 2);
        drive.erase().unwrap();
        assert!(drive.sector_data(1).iter().all(|&b| b == 0xFF));
        assert_eq!(drive.erases(), 1);
    }
}
