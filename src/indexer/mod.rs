pub mod cache;
pub mod core;
pub mod corpus;
pub mod markdown;
