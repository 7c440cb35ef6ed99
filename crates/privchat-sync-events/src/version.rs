//! 版本信息

/// 库版本，来自 Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
