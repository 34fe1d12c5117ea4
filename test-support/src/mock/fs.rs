//! 后备文件的 Mock 实现
//!
//! 注意：这里不直接依赖 `vm` crate（避免循环依赖）。
//! `vm` crate 在 `cfg(test)` 下为 [`MockFile`] 实现 `VmFile`。

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// -EIO
pub const EIO: isize = -5;

/// 内存中的只读文件，记录读取次数并可注入故障
pub struct MockFile {
    id: u64,
    data: Vec<u8>,
    reads: AtomicUsize,
    fail_reads: AtomicBool,
    truncated: AtomicBool,
}

impl MockFile {
    pub fn new(id: u64, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            reads: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            truncated: AtomicBool::new(false),
        }
    }

    /// 生成 `len` 字节内容，第 i 字节为 `(i % 251) as u8`
    pub fn with_pattern(id: u64, len: usize) -> Self {
        Self::new(id, (0..len).map(|i| (i % 251) as u8).collect())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 从 `offset` 读取；文件末尾之后返回 0 字节
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EIO);
        }
        let end = if self.truncated.load(Ordering::SeqCst) {
            self.data.len() / 2
        } else {
            self.data.len()
        };
        if offset >= end {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), end - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    /// 累计 read_at 调用次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// 之后的读取全部返回 -EIO
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// 模拟文件在映射后被截断：`size()` 不变，但读取在一半处遇到 EOF
    pub fn set_truncated(&self, truncated: bool) {
        self.truncated.store(truncated, Ordering::SeqCst);
    }
}
