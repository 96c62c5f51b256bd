//! Demand paging for user programs: a supplemental page table per address
//! space, a frame table with clock eviction, and page-granular swap.
//!
//! The crate is `no_std` on the bare-metal target and links against `std`
//! elsewhere, so the unit tests run on the build machine.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod config;
pub mod dev;
pub mod error;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod system;
pub mod user_program;

pub use config::VmConfig;
pub use error::{Result, VmError};
pub use system::VmSystem;
