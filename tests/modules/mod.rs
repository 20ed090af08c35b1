//! 测试模块根目录
//!
//! 导出所有功能模块的测试

#[allow(unused_imports)]
pub mod cache;
#[allow(unused_imports)]
pub mod factory;
#[allow(unused_imports)]
pub mod optimizer;
#[allow(unused_imports)]
pub mod orchestrator;
