//! 地址模块
//!
//! 此模块提供了用于处理物理地址和虚拟地址，以及页码的抽象。
//!
//! # 地址类型
//!
//! - [`Paddr`] - 物理地址类型
//! - [`Vaddr`] - 虚拟地址类型
//!
//! # 页码
//!
//! - [`PageNum`] - 表示页码的 Trait
//! - [`Ppn`] - 物理页码（Physical Page Number）
//! - [`Vpn`] - 虚拟页码（Virtual Page Number）
//! - [`VpnRange`] - 虚拟页码范围 `[start, end)`
//!
//! 页大小来自 [`crate::MmConfig`]，按字节计算的长度统一用 `usize` 表示。
pub mod page_num;
pub mod types;

pub use page_num::{PageNum, PageNumRange, Ppn, PpnRange, Vpn, VpnRange};
pub use types::{Address, Paddr, UsizeConvert, Vaddr};

/// 获取页大小
#[inline]
pub fn page_size() -> usize {
    crate::mm_config().page_size()
}

/// 向上对齐到页边界，调用者保证结果不溢出
#[inline]
pub fn round_up(len: usize) -> usize {
    let ps = page_size();
    (len + ps - 1) & !(ps - 1)
}

/// 向上对齐到页边界，溢出时返回 `None`
#[inline]
pub fn checked_round_up(len: usize) -> Option<usize> {
    len.checked_next_multiple_of(page_size())
}

/// 覆盖 `len` 字节所需的页数
#[inline]
pub fn pages_for(len: usize) -> usize {
    len.div_ceil(page_size())
}

/// 是否页对齐
#[inline]
pub fn is_page_aligned(value: usize) -> bool {
    value & (page_size() - 1) == 0
}
