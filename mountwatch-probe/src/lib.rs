//! Mountwatch probe layer
//!
//! Everything that touches a workstation goes through this crate:
//! - Command execution with a hard timeout (local process, usually `ssh`)
//! - Probe commands: reachability, mount verification, user census,
//!   directory existence, remount
//! - Parsing of raw probe output into typed observations
//!
//! Classification policy lives in the kernel; this crate only reports what
//! it saw.

pub mod execution;
pub mod observation;
pub mod parser;
pub mod prober;

pub use execution::{CommandOutput, CommandRunner, LocalRunner, EXIT_TIMEOUT, EXIT_UNREACHABLE};
pub use observation::{MountObservation, MountStatus, ProbeError, ProbeOutcome, UserCensus};
pub use parser::{looks_like_transport_error, parse_mount_output};
pub use prober::{ProbeSettings, RemoteProber, SshProber};
