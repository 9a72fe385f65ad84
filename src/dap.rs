//! DAP transaction engine (C2, spec §4.2) plus the per-link handle (§3) that
//! owns the 256 AP records and the transport.

use std::time::{Duration, Instant};

use crate::ap::AccessPort;
use crate::error::Error;
use crate::registers::{
    DpReg, CTRLSTAT_ANY_STICKY_ERROR, CTRLSTAT_CDBGPWRUPACK, CTRLSTAT_CDBGPWRUPREQ,
    CTRLSTAT_CORUNDETECT, CTRLSTAT_CSYSPWRUPACK, CTRLSTAT_CSYSPWRUPREQ, CTRLSTAT_SSTICKYERR,
    CTRLSTAT_SSTICKYORUN,
};
use crate::transport::{ReadSlot, Transport};

/// SELECT shadow value that can never equal a legally-written SELECT,
/// forcing the next AP access to rewrite it (spec §3 invariants).
const SELECT_INVALID: u32 = 0xFFFF_FFFF;

/// Number of attempts `dap_dp_init` makes before giving up (spec §4.6).
const DP_INIT_RETRIES: usize = 10;

/// Default timeout for the power-up handshake polls (spec §4.6).
const POWER_DOMAIN_TIMEOUT_MS: u32 = 10;

/// Per-link handle: the transport, DP shadow state, and the 256 AP records.
///
/// A `Dap` is a single serialization domain (spec §5): nothing here is
/// `Send`/`Sync`, matching the single-threaded-cooperative scheduling model -
/// callers that need concurrency run one `Dap` per physical link, each on its
/// own thread.
pub struct Dap {
    transport: Box<dyn Transport>,
    /// Last SELECT value written to the target, or `SELECT_INVALID`.
    select: u32,
    /// Shadow of DP CTRL/STAT as last written by this crate.
    ctrl_stat: u32,
    /// Fixed for the DAP's lifetime; configure before `dap_dp_init`.
    pub ti_be_32_quirks: bool,
    /// Currently user-selected AP, for the command surface (§6.3).
    pub current_ap: u8,
    ap: Vec<AccessPort>,
}

impl Dap {
    /// Construct a new DAP over `transport`. Mirrors `dap_init()` (§6.1):
    /// every AP record starts with safe defaults (`memaccess_tck = 255`,
    /// `tar_autoincr_block = 1 << 10`), `select` starts invalid, and no
    /// transport traffic is generated yet - callers should follow up with
    /// [`Dap::dap_dp_init`].
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let ap = (0..=255u16).map(|i| AccessPort::new(i as u8)).collect();
        Dap {
            transport,
            select: SELECT_INVALID,
            ctrl_stat: 0,
            ti_be_32_quirks: false,
            current_ap: 0,
            ap,
        }
    }

    /// Borrow AP record `index`.
    pub fn ap(&self, index: u8) -> &AccessPort {
        &self.ap[index as usize]
    }

    /// Mutably borrow AP record `index`.
    pub fn ap_mut(&mut self, index: u8) -> &mut AccessPort {
        &mut self.ap[index as usize]
    }

    /// Setting `ti_be_32_quirks` also forces the implications spec §3 requires:
    /// packed transfers disabled and unaligned access assumed bad on every AP.
    pub fn set_ti_be_32_quirks(&mut self, enabled: bool) {
        self.ti_be_32_quirks = enabled;
        if enabled {
            for ap in &mut self.ap {
                ap.packed_transfers = false;
                ap.unaligned_access_bad = true;
            }
        }
    }

    // --- thin transport adapters (C1 passthrough, §4.1) ---------------------

    /// Queue a DP register read.
    pub fn queue_dp_read(&mut self, reg: DpReg, dst: Option<&ReadSlot>) -> Result<(), Error> {
        self.transport.queue_dp_read(reg as u8, dst)
    }

    /// Queue a DP register write.
    pub fn queue_dp_write(&mut self, reg: DpReg, value: u32) -> Result<(), Error> {
        self.transport.queue_dp_write(reg as u8, value)
    }

    /// Queue an AP register read for `ap_index`, rewriting SELECT first if
    /// the requested (APSEL, APBANKSEL) differs from the cached value.
    pub fn queue_ap_read(
        &mut self,
        ap_index: u8,
        reg: u8,
        dst: Option<&ReadSlot>,
    ) -> Result<(), Error> {
        self.select_bank(ap_index, reg)?;
        self.transport.queue_ap_read(ap_index, reg, dst)
    }

    /// Queue an AP register write for `ap_index`, rewriting SELECT first if needed.
    pub fn queue_ap_write(&mut self, ap_index: u8, reg: u8, value: u32) -> Result<(), Error> {
        self.select_bank(ap_index, reg)?;
        self.transport.queue_ap_write(ap_index, reg, value)
    }

    /// Flush the journal: execute every queued operation through the
    /// transport in FIFO order. On failure the SELECT shadow is invalidated,
    /// since we can no longer be sure what the target last saw (spec §3).
    pub fn run(&mut self) -> Result<(), Error> {
        let result = self.transport.run();
        if result.is_err() {
            self.select = SELECT_INVALID;
        }
        result
    }

    /// Write SELECT iff the (APSEL, APBANKSEL) implied by `ap_index`/`reg`
    /// differs from the cached value (spec §3 invariant on `dap.select`).
    fn select_bank(&mut self, ap_index: u8, reg: u8) -> Result<(), Error> {
        let apbank = (reg >> 4) & 0xF;
        let select = ((ap_index as u32) << 24) | ((apbank as u32) << 4);
        if select != self.select {
            self.transport
                .queue_dp_write(DpReg::Select as u8, select)?;
            self.select = select;
        }
        Ok(())
    }

    // --- C2 utilities --------------------------------------------------------

    /// Repeatedly read `reg` until `(value & mask) == want`, or fail with
    /// [`Error::Timeout`] once `timeout_ms` has elapsed (spec §4.2).
    pub fn poll_dp_register(
        &mut self,
        reg: DpReg,
        mask: u32,
        want: u32,
        timeout_ms: u32,
    ) -> Result<u32, Error> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            let slot = ReadSlot::new(0);
            self.queue_dp_read(reg, Some(&slot))?;
            self.run()?;
            let value = slot.get();
            if value & mask == want {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    register: reg as u8,
                    timeout_ms,
                });
            }
        }
    }

    /// Clear the sticky-overrun/sticky-error latch by writing the relevant
    /// bits to CTRL/STAT (spec §4.2). Subsequent AP operations were failing
    /// until this runs.
    pub fn clear_sticky(&mut self) -> Result<(), Error> {
        tracing::debug!("clearing sticky DP error latch");
        self.queue_dp_write(DpReg::CtrlStat, CTRLSTAT_SSTICKYERR)?;
        self.run()
    }

    /// Power-up handshake and overrun-detect enable (spec §4.6, C6). Retries
    /// the whole sequence up to [`DP_INIT_RETRIES`] times before giving up.
    pub fn dap_dp_init(&mut self) -> Result<(), Error> {
        self.select = SELECT_INVALID;

        let mut last_err = Error::Fault(0);
        for attempt in 0..DP_INIT_RETRIES {
            match self.try_dp_init_once() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(attempt, error = ?e, "dap_dp_init attempt failed, retrying");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn try_dp_init_once(&mut self) -> Result<(), Error> {
        self.queue_dp_read(DpReg::CtrlStat, None)?;
        self.queue_dp_write(DpReg::CtrlStat, CTRLSTAT_SSTICKYERR)?;
        self.queue_dp_read(DpReg::CtrlStat, None)?;

        self.ctrl_stat = CTRLSTAT_CDBGPWRUPREQ | CTRLSTAT_CSYSPWRUPREQ;
        self.queue_dp_write(DpReg::CtrlStat, self.ctrl_stat)?;
        self.run()?;

        tracing::debug!("waiting for CDBGPWRUPACK");
        self.poll_dp_register(
            DpReg::CtrlStat,
            CTRLSTAT_CDBGPWRUPACK,
            CTRLSTAT_CDBGPWRUPACK,
            POWER_DOMAIN_TIMEOUT_MS,
        )?;

        tracing::debug!("waiting for CSYSPWRUPACK");
        self.poll_dp_register(
            DpReg::CtrlStat,
            CTRLSTAT_CSYSPWRUPACK,
            CTRLSTAT_CSYSPWRUPACK,
            POWER_DOMAIN_TIMEOUT_MS,
        )?;

        self.ctrl_stat = CTRLSTAT_CDBGPWRUPREQ | CTRLSTAT_CSYSPWRUPREQ | CTRLSTAT_CORUNDETECT;
        self.queue_dp_write(DpReg::CtrlStat, self.ctrl_stat)?;
        self.queue_dp_read(DpReg::CtrlStat, None)?;
        self.run()
    }

    /// True if `stat` has any sticky-error bit latched.
    pub(crate) fn has_sticky_error(stat: u32) -> bool {
        stat & CTRLSTAT_ANY_STICKY_ERROR != 0
    }

    /// Queue-then-flush an AP read that surfaces a sticky-overrun/-error as
    /// [`Error::Fault`], clearing the latch so the caller can retry if it
    /// chooses to (used by the single-word and atomic I/O paths, §4.4).
    pub(crate) fn read_ctrl_stat_checked(&mut self) -> Result<(), Error> {
        let slot = ReadSlot::new(0);
        self.queue_dp_read(DpReg::CtrlStat, Some(&slot))?;
        self.run()?;
        if Self::has_sticky_error(slot.get()) {
            let stat = slot.get();
            self.clear_sticky()?;
            return Err(Error::Fault((stat & 0xFF) as u8));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;

    #[test]
    fn dap_dp_init_brings_up_power_domains() {
        let mut dap = Dap::new(Box::new(FakeTransport::new(0)));
        dap.dap_dp_init().unwrap();
        assert_eq!(
            dap.ctrl_stat,
            CTRLSTAT_CDBGPWRUPREQ | CTRLSTAT_CSYSPWRUPREQ | CTRLSTAT_CORUNDETECT
        );
    }

    #[test]
    fn dap_dp_init_is_idempotent() {
        let mut dap = Dap::new(Box::new(FakeTransport::new(0)));
        dap.dap_dp_init().unwrap();
        dap.dap_dp_init().unwrap();
        assert_eq!(
            dap.ctrl_stat,
            CTRLSTAT_CDBGPWRUPREQ | CTRLSTAT_CSYSPWRUPREQ | CTRLSTAT_CORUNDETECT
        );
    }

    // E6: a sticky overrun on the very first flush still lets dap_dp_init
    // recover within its retry budget, since try_dp_init_once starts every
    // attempt by reading and clearing CTRL/STAT.
    #[test]
    fn dap_dp_init_recovers_from_sticky_overrun_on_first_try() {
        let mut transport = FakeTransport::new(0);
        transport.fail_after(2, Error::Fault(CTRLSTAT_SSTICKYORUN as u8));
        let mut dap = Dap::new(Box::new(transport));
        dap.dap_dp_init().unwrap();
    }

    #[test]
    fn select_bank_elides_redundant_select_writes() {
        let mut dap = Dap::new(Box::new(FakeTransport::new(16)));
        dap.select_bank(3, 0x00).unwrap();
        let after_first = dap.select;
        dap.select_bank(3, 0x00).unwrap();
        assert_eq!(dap.select, after_first);
        dap.select_bank(3, 0x10).unwrap();
        assert_ne!(dap.select, after_first, "changing APBANKSEL must rewrite SELECT");
    }

    #[test]
    fn run_failure_invalidates_select_shadow() {
        let mut transport = FakeTransport::new(16);
        transport.fail_after(0, Error::Fault(0));
        let mut dap = Dap::new(Box::new(transport));
        dap.select_bank(1, 0).unwrap();
        assert!(dap.run().is_err());
        assert_eq!(dap.select, SELECT_INVALID);
    }

    #[test]
    fn clear_sticky_writes_sstickyerr() {
        let mut dap = Dap::new(Box::new(FakeTransport::new(16)));
        dap.clear_sticky().unwrap();
    }
}
