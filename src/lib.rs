//! Host-side driver core for the ARM Debug Interface v5 (ADIv5): the
//! DAP/MEM-AP transaction engine, the block transfer engine, and a
//! CoreSight ROM-table walker, all built over a pluggable [`Transport`] so
//! that the concrete physical link (JTAG-DP, SW-DP, a debug probe's own
//! USB protocol, ...) stays out of this crate entirely.
//!
//! Start with [`Dap::new`], call [`Dap::dap_dp_init`] to bring the power
//! domains up, then probe APs with [`Dap::find_ap`]/[`Dap::get_debugbase`]
//! and read/write memory through the [`Dap`] methods added by `ap` and
//! `block`. [`testing::FakeTransport`] is a ready-made transport for trying
//! the API out without a physical debug probe attached.

pub mod ap;
pub mod block;
pub mod cli;
pub mod dap;
pub mod error;
pub mod registers;
pub mod rom_table;
pub mod testing;
pub mod transport;

pub use ap::AccessPort;
pub use dap::Dap;
pub use error::{Error, TransferError, TransferResult};
pub use rom_table::ComponentId;
pub use transport::{Port, ReadSlot, Transport};
