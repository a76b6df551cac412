//! Screen-time tracker with per-app daily goals, streaks and month charts,
//! plus friends and groups competing on a shared goal. Usage lives in a
//! local store that mirrors a remote document store and syncs best-effort,
//! so everything keeps working offline.

pub mod cli;
pub mod platform;
pub mod session;
pub mod social;
pub mod store;
pub mod usage;
pub mod utils;
