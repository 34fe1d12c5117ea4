//! 测试支持 crate
//!
//! 提供宿主机单元测试使用的 Mock 实现

#![no_std]

extern crate alloc;

pub mod mock;
