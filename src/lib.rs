// ABOUTME: Library root for sshpipe - remote command execution and SCP upload over SSH.
// ABOUTME: The CLI binary is in main.rs.

pub mod config;
pub mod error;
pub mod ssh;
