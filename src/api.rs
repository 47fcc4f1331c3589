pub mod greeting;
pub mod identity;
pub mod sql;
pub mod version;
