//! 虚拟内存管理子系统
//!
//! 提供地址空间与映射区域管理、按需缺页、页缓存与写时复制，以及
//! fork/exec 时的地址空间克隆。
//!
//! # 组成
//!
//! - [`VmSpace`]：地址空间，持有互不重叠的 [`VmArea`] 与页表后端
//! - [`VmPage`] / [`PageCache`]：被映射的物理页与共享文件页索引
//! - [`VmSpace::handle_page_fault`]：缺页解析
//! - [`VmSpace::clone_into`]：地址空间克隆
//!
//! # 架构解耦
//!
//! 通过 trait 抽象与架构特定组件解耦：
//! - [`ArchMmOps`]: 物理帧的临时映射
//! - [`MmConfig`]: 页大小与映射布局常量
//! - [`PageTableOps`]: 页表后端
//! - [`FrameAllocator`]: 物理帧分配
//! - [`VmFile`]: 后备存储读取
//!
//! 使用前必须调用 [`register_arch_ops`] 和 [`register_config`] 注册实现。

#![no_std]

extern crate alloc;

mod arch_ops;
mod config;
mod context;
mod error;
mod file;

pub mod address;
pub mod frame_allocator;
pub mod memory_space;
pub mod page_table;
pub mod vm_page;

#[cfg(test)]
mod tests;

pub use arch_ops::{ArchMmOps, arch_ops, register_arch_ops};
pub use config::{MmConfig, mm_config, register_config};
pub use context::{FaultStats, FaultStatsSnapshot, VmContext};
pub use error::{VmError, VmResult};
pub use file::{FileId, VmFile};

// Re-export 常用类型
pub use address::{Address, PageNum, Paddr, Ppn, PpnRange, UsizeConvert, Vaddr, Vpn, VpnRange};
pub use frame_allocator::{BitmapFrameAllocator, FrameAllocator, FrameTracker};
pub use memory_space::{AreaFlags, AreaId, Backing, CloneMode, FaultType, VmArea, VmSpace};
pub use page_table::{PageTableOps, PagingError, PagingResult, UniversalPTEFlag};
pub use vm_page::{CacheKey, PageCache, PageFlags, PageKind, VmPage};
