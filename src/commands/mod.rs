pub mod init;
pub mod list_benchmarks;
pub mod status;
pub mod update;
