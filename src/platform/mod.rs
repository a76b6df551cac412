pub mod apps;
pub mod auth;
pub mod usage_stats;
