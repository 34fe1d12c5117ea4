//! 页码抽象模块
//!
//! 此模块定义了表示页码 (Page Number) 的 Trait 和具体的页码类型 (Ppn, Vpn)，
//! 以及用于处理连续页码的范围结构 (PageNumRange)。
//!
//! 区域内已解析的页以 [`Vpn`] 为键保存，因此区域头部被收缩后，
//! 剩余页的键保持不变。

use crate::address::types::{Address, Paddr, UsizeConvert, Vaddr};
use core::fmt;

use super::page_size;

/// [PageNum] Trait
/// ---------------------
/// 表示一个页码的 Trait。所有页码类型 (如 Ppn 和 Vpn) 必须实现此 Trait。
pub trait PageNum: UsizeConvert + Copy + Clone + PartialEq + PartialOrd + Eq + Ord {
    /// 此页码类型关联的地址类型（例如 Ppn 关联 Paddr，Vpn 关联 Vaddr）。
    type TAddress: Address;

    /// 将页码增加 1。
    fn step(&mut self) {
        self.step_by(1);
    }

    /// 将页码增加给定的页数。
    fn step_by(&mut self, offset: usize) {
        *self = Self::from_usize(self.as_usize() + offset);
    }

    /// 返回增加 `offset` 页后的页码
    fn offset(self, offset: usize) -> Self {
        Self::from_usize(self.as_usize() + offset)
    }

    /// 将地址转换为页码 (向下取整，即包含该地址的页)。
    fn from_addr_floor(addr: Self::TAddress) -> Self {
        Self::from_usize(addr.as_usize() / page_size())
    }

    /// 将地址转换为页码 (向上取整)。
    ///
    /// 如果地址恰好是页的起始，则返回该页页码；否则返回下一页的页码。
    fn from_addr_ceil(addr: Self::TAddress) -> Self {
        Self::from_usize(addr.as_usize().div_ceil(page_size()))
    }

    /// 页的起始地址。
    fn start_addr(self) -> Self::TAddress {
        Self::TAddress::from_usize(self.as_usize() * page_size())
    }

    /// 页的结束地址 (即下一页的起始地址，不包含在页内)。
    fn end_addr(self) -> Self::TAddress {
        Self::TAddress::from_usize((self.as_usize() + 1) * page_size())
    }
}

/// `impl_page_num!` 宏
/// ---------------------
/// 为给定类型实现 `UsizeConvert` 和 `PageNum` Trait，并绑定地址类型。
macro_rules! impl_page_num {
    ($type:ident, $addr_type:ty) => {
        impl UsizeConvert for $type {
            fn as_usize(&self) -> usize {
                self.0
            }

            fn from_usize(value: usize) -> Self {
                Self(value)
            }
        }

        impl PageNum for $type {
            type TAddress = $addr_type;
        }

        impl fmt::Display for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

/// [Ppn] (Physical Page Number)
/// ---------------------
/// 物理页码，对应物理地址 (Paddr)。
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Ppn(pub usize);
impl_page_num!(Ppn, Paddr);

/// [Vpn] (Virtual Page Number)
/// ---------------------
/// 虚拟页码，对应虚拟地址 (Vaddr)。
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Vpn(pub usize);
impl_page_num!(Vpn, Vaddr);

/// [PageNumRange]
/// ---------------------
/// 泛型页码范围结构，表示一个半开区间 `[start, end)`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageNumRange<T>
where
    T: PageNum,
{
    /// 范围的起始页码 (包含)。
    pub start: T,
    /// 范围的结束页码 (不包含)。
    pub end: T,
}

impl<T> PageNumRange<T>
where
    T: PageNum,
{
    /// 创建一个新的页码范围。
    pub fn new(start: T, end: T) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// 从起始页码和长度 (页数) 创建一个页码范围。
    pub fn from_start_len(start: T, len: usize) -> Self {
        Self {
            start,
            end: T::from_usize(start.as_usize() + len),
        }
    }

    /// 获取起始页码。
    pub fn start(&self) -> T {
        self.start
    }

    /// 获取结束页码 (不包含)。
    pub fn end(&self) -> T {
        self.end
    }

    /// 获取范围内的页数。
    pub fn len(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    /// 检查范围是否为空 (即 start == end)。
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 检查范围是否包含给定的页码。
    pub fn contains(&self, page: T) -> bool {
        page >= self.start && page < self.end
    }

    /// 检查两个范围是否重叠。
    ///
    /// 注意: 相邻的范围不视为重叠。
    pub fn overlaps(&self, other: &Self) -> bool {
        !(self.end <= other.start || self.start >= other.end)
    }

    /// 获取范围的迭代器。
    pub fn iter(&self) -> PageNumRangeIterator<T> {
        PageNumRangeIterator {
            range: *self,
            current: self.start,
        }
    }
}

impl<T> IntoIterator for PageNumRange<T>
where
    T: PageNum,
{
    type Item = T;
    type IntoIter = PageNumRangeIterator<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// 页码范围的迭代器，按升序返回范围内的每个页码。
pub struct PageNumRangeIterator<T>
where
    T: PageNum,
{
    range: PageNumRange<T>,
    current: T,
}

impl<T> Iterator for PageNumRangeIterator<T>
where
    T: PageNum,
{
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.range.end {
            return None;
        }
        let result = self.current;
        self.current.step();
        Some(result)
    }
}

/// 物理页码范围的类型别名
pub type PpnRange = PageNumRange<Ppn>;
/// 虚拟页码范围的类型别名
pub type VpnRange = PageNumRange<Vpn>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_test_env;

    #[test]
    fn test_page_num_start_end_addr() {
        init_test_env();
        let vpn = Vpn::from_usize(1);
        assert_eq!(vpn.start_addr().as_usize(), 4096);
        assert_eq!(vpn.end_addr().as_usize(), 8192);
    }

    #[test]
    fn test_page_num_from_addr_floor_ceil() {
        init_test_env();
        let a = Vaddr::from_usize(4096);
        assert_eq!(Vpn::from_addr_floor(a).as_usize(), 1);
        assert_eq!(Vpn::from_addr_ceil(a).as_usize(), 1);

        let b = Vaddr::from_usize(4097);
        assert_eq!(Vpn::from_addr_floor(b).as_usize(), 1);
        assert_eq!(Vpn::from_addr_ceil(b).as_usize(), 2);
    }

    #[test]
    fn test_range_overlap_is_half_open() {
        let a = VpnRange::new(Vpn(10), Vpn(20));
        assert!(a.overlaps(&VpnRange::new(Vpn(19), Vpn(30))));
        assert!(!a.overlaps(&VpnRange::new(Vpn(20), Vpn(30))));
        assert!(!a.overlaps(&VpnRange::new(Vpn(0), Vpn(10))));
        assert_eq!(a.iter().count(), 10);
        assert!(a.contains(Vpn(10)) && !a.contains(Vpn(20)));
    }
}
