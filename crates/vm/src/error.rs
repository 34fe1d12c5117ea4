//! 虚拟内存错误类型
//!
//! 请求级操作（映射、解除映射、克隆）把错误返回给调用者；
//! 缺页路径上的错误由陷入处理者决定终止哪个上下文。

use core::fmt;

use crate::page_table::PagingError;

/// 虚拟内存操作的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// 地址不属于任何区域，或访问权限不符
    BadAddress,
    /// 长度为零，或偏移超出文件末尾
    BadLength,
    /// 地址或偏移未按页对齐
    BadAlignment,
    /// 请求的范围与现有区域以不可调和的方式冲突
    NoSpace,
    /// 物理帧或元数据内存耗尽
    ResourceExhausted,
    /// 后备存储读取失败（携带负的 errno）
    Io(isize),
    /// 内部不变量被破坏，例如非缺页区域发生了缺页
    InvariantViolation,
}

/// 虚拟内存操作的结果类型
pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    /// 转换为负的 POSIX errno
    pub fn to_errno(self) -> isize {
        match self {
            VmError::BadAddress => -14,   // EFAULT
            VmError::BadLength => -22,    // EINVAL
            VmError::BadAlignment => -22, // EINVAL
            VmError::NoSpace => -12,      // ENOMEM
            VmError::ResourceExhausted => -12,
            VmError::Io(errno) if errno < 0 => errno,
            VmError::Io(_) => -5, // EIO
            VmError::InvariantViolation => -14,
        }
    }

    /// 错误是否意味着内核状态已不可信，陷入处理者必须停机
    pub fn is_fatal(self) -> bool {
        matches!(self, VmError::InvariantViolation)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::BadAddress => write!(f, "bad address"),
            VmError::BadLength => write!(f, "bad length"),
            VmError::BadAlignment => write!(f, "bad alignment"),
            VmError::NoSpace => write!(f, "no space for mapping"),
            VmError::ResourceExhausted => write!(f, "out of memory"),
            VmError::Io(errno) => write!(f, "backing store I/O error ({})", errno),
            VmError::InvariantViolation => write!(f, "vm invariant violated"),
        }
    }
}

impl From<PagingError> for VmError {
    fn from(err: PagingError) -> Self {
        match err {
            PagingError::FrameAllocFailed | PagingError::OutOfMemory => {
                VmError::ResourceExhausted
            }
            _ => VmError::InvariantViolation,
        }
    }
}
