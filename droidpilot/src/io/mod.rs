//! I/O boundaries: configuration, device, oracle processes, prompts and reports.

pub mod config;
pub mod device;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod report;
