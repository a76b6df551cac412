pub mod entities;
pub mod fs_remote;
mod json_file;
pub mod local;
pub mod memory;
pub mod remote;
