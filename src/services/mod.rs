//! 服务层模块
//!
//! 包含核心业务逻辑：部署执行与阶段分类

pub mod classifier;
pub mod deploy;
