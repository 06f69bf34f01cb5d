pub mod config;
pub mod direct_io;
pub mod fs_stat;
pub mod plot_group;
pub mod plot_path;
pub mod tool;
pub mod wire;
