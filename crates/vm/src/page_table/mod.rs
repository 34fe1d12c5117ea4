//! 页表模块
//!
//! 本模块定义虚拟内存核心与架构页表后端之间的接口。页表项的具体编码、
//! 多级页表遍历和 TLB 刷新都由后端负责，核心只按页号提交映射请求。
mod table;

#[cfg(any(test, feature = "soft-mmu"))]
mod soft;

#[cfg(any(test, feature = "soft-mmu"))]
pub use soft::{SoftEntry, SoftPageTable};
pub use table::PageTableOps;

use bitflags::bitflags;

bitflags! {
    /// 与架构无关的页表项标志
    ///
    /// 后端负责把它翻译为硬件格式。空标志加上缺省的物理页号表示
    /// 一个占位（不存在）的翻译。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UniversalPTEFlag: usize {
        /// 有效
        const VALID = 1 << 0;
        /// 可读
        const READABLE = 1 << 1;
        /// 可写
        const WRITEABLE = 1 << 2;
        /// 可执行
        const EXECUTABLE = 1 << 3;
        /// 用户态可访问
        const USER_ACCESSIBLE = 1 << 4;
        /// 全局映射
        const GLOBAL = 1 << 5;
        /// 已访问
        const ACCESSED = 1 << 6;
        /// 已修改
        const DIRTY = 1 << 7;
    }
}

/// 分页操作中可能发生的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// 虚拟地址未被映射
    NotMapped,
    /// 虚拟地址已被映射
    AlreadyMapped,
    /// 提供了无效的地址
    InvalidAddress,
    /// 提供了无效的标志（Flags）
    InvalidFlags,
    /// 页表本身的帧分配失败
    FrameAllocFailed,
    /// 页表已被销毁
    Destroyed,
    /// 内存耗尽
    OutOfMemory,
}

/// 分页操作的结果类型
pub type PagingResult<T> = Result<T, PagingError>;
