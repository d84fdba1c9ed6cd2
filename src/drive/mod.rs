//! 驱动抽象
//!
//! 缓存之下的物理驱动接口。
//! drive/device.rs 定义 [`MediaDrive`] trait 以及注册时读取的几何参数，
//! drive/ram.rs 提供内存驱动，便于测试。

mod device;
mod ram;

pub use device::{DriveGeometry, DriveTag, MediaDrive};
pub use ram::{RamDrive, TransactionRecord};
