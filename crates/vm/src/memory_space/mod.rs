//! 地址空间模块
//!
//! 本模块定义了地址空间（[`VmSpace`]）与其中的映射区域（[`VmArea`]），
//! 以及缺页解析、写时复制和地址空间克隆。

mod area;
mod clone;
mod cow;
mod fault;
mod space;

pub use area::{AreaFlags, AreaId, Backing, VmArea};
pub use clone::CloneMode;
pub use fault::FaultType;
pub use space::VmSpace;
