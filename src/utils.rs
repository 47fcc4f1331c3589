pub mod authn;
pub mod config;
pub mod errors;
pub mod fixed_query;
pub mod iwa_utils;
