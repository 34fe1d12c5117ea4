//! 后备存储接口 trait 定义

use crate::error::{VmError, VmResult};

/// 文件在页缓存中的标识
///
/// 与页对齐偏移一起构成缓存键，同一文件的所有映射共享缓存页。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u64);

/// 可映射到内存的只读后备存储
///
/// 此 trait 抽象了文件映射所需的最小接口。
/// vfs 的文件对象需要实现此 trait。
pub trait VmFile: Send + Sync {
    /// 缓存键中使用的文件标识，同一文件必须稳定且唯一
    fn id(&self) -> FileId;

    /// 文件长度（字节）
    fn size(&self) -> usize;

    /// 从指定偏移读取数据到缓冲区，返回读到的字节数；错误时返回负的 errno
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize>;
}

/// 从 `offset` 读满 `buf`
///
/// 在读满之前遇到文件末尾视为 I/O 错误。
pub(crate) fn read_exact(file: &dyn VmFile, offset: usize, buf: &mut [u8]) -> VmResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = file
            .read_at(offset + done, &mut buf[done..])
            .map_err(VmError::Io)?;
        if n == 0 {
            log::warn!(
                "vm: short read from file {:?} at {:#x}: got {} of {} bytes",
                file.id(),
                offset,
                done,
                buf.len()
            );
            return Err(VmError::Io(-5));
        }
        done += n;
    }
    Ok(())
}
