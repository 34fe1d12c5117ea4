//! 地址类型
//!
//! [`Vaddr`] 与 [`Paddr`] 都是 `usize` 的透明包装，区分两个地址空间，
//! 避免把物理地址误当作虚拟地址解引用。

use core::fmt;
use core::ops::{Add, Sub};

/// 在类型和 usize 之间进行转换
pub trait UsizeConvert: Copy {
    /// 转为 usize
    fn as_usize(&self) -> usize;
    /// 由 usize 构造
    fn from_usize(value: usize) -> Self;
}

/// 内存地址（物理或虚拟）
pub trait Address: UsizeConvert + Ord {
    /// 向下对齐到页边界
    fn align_down_to_page(self) -> Self {
        Self::from_usize(self.as_usize() & !(super::page_size() - 1))
    }

    /// 向上对齐到页边界
    fn align_up_to_page(self) -> Self {
        Self::from_usize(super::round_up(self.as_usize()))
    }

    /// 页内偏移
    fn page_offset(self) -> usize {
        self.as_usize() & (super::page_size() - 1)
    }

    /// 是否页对齐
    fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

macro_rules! impl_address {
    ($type:ident) => {
        impl UsizeConvert for $type {
            fn as_usize(&self) -> usize {
                self.0
            }

            fn from_usize(value: usize) -> Self {
                Self(value)
            }
        }

        impl Address for $type {}

        impl Add<usize> for $type {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$type> for $type {
            type Output = usize;

            fn sub(self, rhs: $type) -> usize {
                self.0 - rhs.0
            }
        }

        impl fmt::LowerHex for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

/// 虚拟地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct Vaddr(pub usize);
impl_address!(Vaddr);

/// 物理地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct Paddr(pub usize);
impl_address!(Paddr);

impl Paddr {
    /// 通过架构提供的临时映射得到可访问该物理地址的内核虚拟地址
    pub fn to_vaddr(self) -> Vaddr {
        Vaddr(crate::arch_ops().paddr_to_vaddr(self.0))
    }
}

impl Vaddr {
    /// 转为可变裸指针
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// 转为裸指针
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }
}
