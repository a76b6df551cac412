pub mod friends;
pub mod groups;
pub mod monitor;
