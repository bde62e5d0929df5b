//! # Pgas-Lower Distributed-Memory Lowering
//!
//! Middle-end passes that take a type-resolved, whole-program IR for a
//! PGAS language and rewrite it for execution across multiple locales:
//! task/locale lowering, wide-reference construction, and locality
//! narrowing.

pub mod base;
pub mod config;
pub mod ir;
pub mod passes;
pub mod testing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
