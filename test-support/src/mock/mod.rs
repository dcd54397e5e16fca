//! Mock 实现模块
//!
//! 提供收包路径运行时服务的 Mock 实现，用于测试

pub mod net;
