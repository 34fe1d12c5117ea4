//! 软件页表
//!
//! 在宿主机上模拟页表后端：用有序映射保存每个虚拟页的翻译，
//! 并记录调用次数，便于测试观察核心提交了哪些映射请求。

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::{PageTableOps, PagingError, PagingResult, UniversalPTEFlag};
use crate::address::{PageNum, Ppn, Vpn};

static NEXT_ROOT: AtomicUsize = AtomicUsize::new(1);

/// 软件页表中的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftEntry {
    /// 物理页号，占位翻译为 `None`
    pub ppn: Option<Ppn>,
    /// 标志
    pub flags: UniversalPTEFlag,
}

impl SoftEntry {
    /// 是否为占位翻译
    pub fn is_placeholder(&self) -> bool {
        self.ppn.is_none()
    }
}

/// 以 `BTreeMap` 模拟的页表后端
#[derive(Debug)]
pub struct SoftPageTable {
    root: Ppn,
    entries: BTreeMap<Vpn, SoftEntry>,
    destroyed: bool,
    map_calls: usize,
    unmap_calls: usize,
}

impl SoftPageTable {
    /// 查询一项（包括占位翻译）
    pub fn entry(&self, vpn: Vpn) -> Option<SoftEntry> {
        self.entries.get(&vpn).copied()
    }

    /// 存在的翻译数量（不含占位）
    pub fn present_count(&self) -> usize {
        self.entries.values().filter(|e| e.ppn.is_some()).count()
    }

    /// 全部项数量（含占位）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否没有任何项
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 是否已销毁
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// `map_pages` 调用次数
    pub fn map_calls(&self) -> usize {
        self.map_calls
    }

    /// `unmap_pages` 调用次数
    pub fn unmap_calls(&self) -> usize {
        self.unmap_calls
    }
}

impl PageTableOps for SoftPageTable {
    fn new() -> PagingResult<Self> {
        Ok(SoftPageTable {
            root: Ppn(NEXT_ROOT.fetch_add(1, Ordering::Relaxed)),
            entries: BTreeMap::new(),
            destroyed: false,
            map_calls: 0,
            unmap_calls: 0,
        })
    }

    fn root_ppn(&self) -> Ppn {
        self.root
    }

    fn map_pages(
        &mut self,
        vpn: Vpn,
        ppn: Option<Ppn>,
        count: usize,
        flags: UniversalPTEFlag,
    ) -> PagingResult<()> {
        if self.destroyed {
            return Err(PagingError::Destroyed);
        }
        if ppn.is_none() && !flags.is_empty() {
            return Err(PagingError::InvalidFlags);
        }
        self.map_calls += 1;
        for i in 0..count {
            self.entries.insert(
                vpn.offset(i),
                SoftEntry {
                    ppn: ppn.map(|p| p.offset(i)),
                    flags,
                },
            );
        }
        Ok(())
    }

    fn unmap_pages(&mut self, vpn: Vpn, count: usize) -> PagingResult<()> {
        if self.destroyed {
            return Err(PagingError::Destroyed);
        }
        self.unmap_calls += 1;
        for i in 0..count {
            self.entries.remove(&vpn.offset(i));
        }
        Ok(())
    }

    fn translate(&self, vpn: Vpn) -> Option<(Ppn, UniversalPTEFlag)> {
        let entry = self.entries.get(&vpn)?;
        entry.ppn.map(|ppn| (ppn, entry.flags))
    }

    fn destroy(&mut self) {
        self.entries.clear();
        self.destroyed = true;
    }
}
