//! 数据库迁移
//!
//! 迁移脚本在编译期内嵌进二进制，`Infrastructure::connect` 建连后自动执行。

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
