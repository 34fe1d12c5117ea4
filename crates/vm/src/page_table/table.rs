//! 页表后端接口
//!
//! ## 设计要点
//!
//! - `PageTableOps` 由各架构实现（例如不同 MMU、不同页表格式）。
//! - 上层（如 [`crate::memory_space::VmSpace`]）只依赖该 trait，
//!   从而实现"地址空间管理逻辑"与"页表硬件细节"的解耦。
//! - 每个地址空间持有一个实例，并在自己的锁下调用它；后端不需要内部同步。
//! - TLB 刷新由后端在 `map_pages`/`unmap_pages` 中自行完成。

use super::{PagingResult, UniversalPTEFlag};
use crate::address::{Ppn, Vpn};

/// 每个地址空间一个的页表后端
pub trait PageTableOps: Send {
    /// 创建新页表，并复制内核部分的映射
    fn new() -> PagingResult<Self>
    where
        Self: Sized;

    /// 获取根页表的 PPN
    fn root_ppn(&self) -> Ppn;

    /// 映射 `count` 个连续虚拟页
    ///
    /// `ppn` 为 `Some(p)` 时第 i 页映射到 `p + i`；为 `None` 时写入占位
    /// 翻译（不存在的页表项），仅预留页表结构。已存在的翻译被覆盖。
    fn map_pages(
        &mut self,
        vpn: Vpn,
        ppn: Option<Ppn>,
        count: usize,
        flags: UniversalPTEFlag,
    ) -> PagingResult<()>;

    /// 移除 `count` 个连续虚拟页的翻译（包括占位翻译），不存在的翻译被忽略
    fn unmap_pages(&mut self, vpn: Vpn, count: usize) -> PagingResult<()>;

    /// 查询一个存在的翻译
    fn translate(&self, vpn: Vpn) -> Option<(Ppn, UniversalPTEFlag)>;

    /// 释放页表结构本身；之后的所有操作返回错误
    fn destroy(&mut self);
}
