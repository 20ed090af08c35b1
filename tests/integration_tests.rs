//! 集成测试入口
//!
//! 使用 cargo test --test integration_tests 运行

mod common;
mod modules;
