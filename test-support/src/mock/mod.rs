//! Mock 实现模块
//!
//! 提供架构、内存管理和文件后备存储的 Mock 实现，用于测试

pub mod arch;
pub mod fs;
pub mod mm;
