//! An in-memory fake [`Transport`] used by this crate's own unit tests and
//! available to downstream integration tests that want to exercise the
//! queued-transaction engine without a real debug probe attached.
//!
//! Modeled on `probe-rs`'s `MockMemoryAp`: a flat byte array stands in for
//! target memory, and DRW/TAR/CSW bookkeeping follows the same lane and
//! auto-increment rules real MEM-AP silicon does. Unlike the real link, every
//! operation executes the moment it's queued; `run` only ever reports a
//! fault that was latched along the way, per the eager-execution allowance
//! in [`Transport`]'s contract.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::Error;
use crate::registers::{ApReg, DpReg};
use crate::transport::{ReadSlot, Transport};

fn csw_size_bytes(csw: u32) -> u32 {
    match csw & 0x7 {
        0 => 1,
        1 => 2,
        _ => 4,
    }
}

/// 0 = off, 1 = single, 2 = packed (CSW bits [5:4]).
fn csw_addrinc(csw: u32) -> u32 {
    (csw >> 4) & 0x3
}

/// A fake MEM-AP-backed target: one flat memory array, real lane/increment
/// semantics, and presettable IDR/CFG/BASE registers per AP for discovery
/// and ROM-table tests.
#[derive(Debug)]
pub struct FakeTransport {
    pub memory: Vec<u8>,
    ap_csw: HashMap<u8, u32>,
    ap_tar: HashMap<u8, u32>,
    /// Presettable read-only identification registers, keyed by AP index.
    pub ap_idr: HashMap<u8, u32>,
    pub ap_cfg: HashMap<u8, u32>,
    pub ap_base: HashMap<u8, u32>,
    dp_ctrlstat: u32,
    /// Log of every completed write, in order, for test assertions.
    pub write_log: Vec<(u8, u8, u32)>,
    /// Number of remaining operations that will succeed before a forced
    /// fault; `None` means no injected fault.
    op_budget: Option<usize>,
    /// The error to raise once `op_budget` counts down to zero.
    injected_fault: Option<Error>,
    /// Latched fault waiting to be reported by the next `run`.
    fault: Option<Error>,
}

impl FakeTransport {
    /// A memory backed by `size` zeroed bytes, no injected faults.
    pub fn new(size: usize) -> Self {
        FakeTransport {
            memory: vec![0u8; size],
            ap_csw: HashMap::new(),
            ap_tar: HashMap::new(),
            ap_idr: HashMap::new(),
            ap_cfg: HashMap::new(),
            ap_base: HashMap::new(),
            dp_ctrlstat: 0,
            write_log: Vec::new(),
            op_budget: None,
            injected_fault: None,
            fault: None,
        }
    }

    /// Make the `n`-th operation from now (0-indexed) fail with `err`; every
    /// operation before it still succeeds, and the fault surfaces through
    /// the next `run`. Used to exercise the partial-transfer recovery paths
    /// in the block engine.
    pub fn fail_after(&mut self, n: usize, err: Error) {
        self.op_budget = Some(n);
        self.injected_fault = Some(err);
    }

    /// Returns true if this operation should be skipped because a fault has
    /// already latched (either just now, or on a previous call).
    fn consume_budget(&mut self) -> bool {
        if self.fault.is_some() {
            return true;
        }
        if let Some(n) = self.op_budget {
            if n == 0 {
                self.op_budget = None;
                self.fault = self.injected_fault.take();
                return true;
            }
            self.op_budget = Some(n - 1);
        }
        false
    }

    fn mem_ap_write(&mut self, addr: u32, size: u32, value: u32) {
        for i in 0..size {
            let a = addr.wrapping_add(i) as usize;
            if a >= self.memory.len() {
                continue;
            }
            let lane = (addr.wrapping_add(i) & 3) as u32;
            self.memory[a] = (value >> (8 * lane)) as u8;
        }
    }

    fn mem_ap_read(&self, addr: u32, size: u32) -> u32 {
        let mut value = 0u32;
        for i in 0..size {
            let a = addr.wrapping_add(i) as usize;
            let lane = (addr.wrapping_add(i) & 3) as u32;
            let byte = *self.memory.get(a).unwrap_or(&0);
            value |= (byte as u32) << (8 * lane);
        }
        value
    }

    fn do_ap_read(&mut self, ap_index: u8, reg: u8) -> u32 {
        match reg {
            r if r == ApReg::Csw as u8 => *self.ap_csw.get(&ap_index).unwrap_or(&0),
            r if r == ApReg::Tar as u8 => *self.ap_tar.get(&ap_index).unwrap_or(&0),
            r if r == ApReg::Idr as u8 => *self.ap_idr.get(&ap_index).unwrap_or(&0),
            r if r == ApReg::Cfg as u8 => *self.ap_cfg.get(&ap_index).unwrap_or(&0),
            r if r == ApReg::Base as u8 => *self.ap_base.get(&ap_index).unwrap_or(&0),
            r if r == ApReg::Drw as u8 => {
                let csw = *self.ap_csw.get(&ap_index).unwrap_or(&0);
                let tar = *self.ap_tar.get(&ap_index).unwrap_or(&0);
                let size = csw_size_bytes(csw);
                let value = self.mem_ap_read(tar, size);
                let advance = match csw_addrinc(csw) {
                    1 => size,
                    2 => 4,
                    _ => 0,
                };
                self.ap_tar.insert(ap_index, tar.wrapping_add(advance));
                value
            }
            bd if (ApReg::Bd0 as u8..=ApReg::Bd3 as u8).contains(&bd) => {
                let tar = *self.ap_tar.get(&ap_index).unwrap_or(&0);
                let addr = (tar & 0xFFFF_FFF0) | (bd - ApReg::Bd0 as u8) as u32;
                self.mem_ap_read(addr, 4)
            }
            _ => 0,
        }
    }

    fn do_ap_write(&mut self, ap_index: u8, reg: u8, value: u32) {
        self.write_log.push((ap_index, reg, value));
        match reg {
            r if r == ApReg::Csw as u8 => {
                self.ap_csw.insert(ap_index, value);
            }
            r if r == ApReg::Tar as u8 => {
                self.ap_tar.insert(ap_index, value);
            }
            r if r == ApReg::Drw as u8 => {
                let csw = *self.ap_csw.get(&ap_index).unwrap_or(&0);
                let tar = *self.ap_tar.get(&ap_index).unwrap_or(&0);
                let size = csw_size_bytes(csw);
                self.mem_ap_write(tar, size, value);
                let advance = match csw_addrinc(csw) {
                    1 => size,
                    2 => 4,
                    _ => 0,
                };
                self.ap_tar.insert(ap_index, tar.wrapping_add(advance));
            }
            bd if (ApReg::Bd0 as u8..=ApReg::Bd3 as u8).contains(&bd) => {
                let tar = *self.ap_tar.get(&ap_index).unwrap_or(&0);
                let addr = (tar & 0xFFFF_FFF0) | (bd - ApReg::Bd0 as u8) as u32;
                self.mem_ap_write(addr, 4, value);
            }
            _ => {}
        }
    }
}

impl Transport for FakeTransport {
    fn queue_dp_read(&mut self, reg: u8, dst: Option<&ReadSlot>) -> Result<(), Error> {
        if self.consume_budget() {
            return Ok(());
        }
        let value = if reg == DpReg::CtrlStat as u8 {
            self.dp_ctrlstat
        } else {
            0
        };
        if let Some(dst) = dst {
            dst.set(value);
        }
        Ok(())
    }

    fn queue_dp_write(&mut self, reg: u8, value: u32) -> Result<(), Error> {
        if self.consume_budget() {
            return Ok(());
        }
        if reg == DpReg::CtrlStat as u8 {
            let mut stat = value;
            // Real power domains ack essentially instantly in this fake.
            if stat & (1 << 28) != 0 {
                stat |= 1 << 29;
            }
            if stat & (1 << 30) != 0 {
                stat |= 1 << 31;
            }
            // Writing the sticky-error bit clears the latch (W1C).
            stat &= !(1 << 5);
            self.dp_ctrlstat = stat;
        }
        Ok(())
    }

    fn queue_ap_read(
        &mut self,
        ap_index: u8,
        reg: u8,
        dst: Option<&ReadSlot>,
    ) -> Result<(), Error> {
        if self.consume_budget() {
            return Ok(());
        }
        let value = self.do_ap_read(ap_index, reg);
        if let Some(dst) = dst {
            dst.set(value);
        }
        Ok(())
    }

    fn queue_ap_write(&mut self, ap_index: u8, reg: u8, value: u32) -> Result<(), Error> {
        if self.consume_budget() {
            return Ok(());
        }
        self.do_ap_write(ap_index, reg, value);
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        match self.fault.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Lets a test keep a handle to a `FakeTransport` after handing one off to a
/// `Dap`, which otherwise takes ownership behind `Box<dyn Transport>`.
impl<T: Transport> Transport for Rc<RefCell<T>> {
    fn queue_dp_read(&mut self, reg: u8, dst: Option<&ReadSlot>) -> Result<(), Error> {
        self.borrow_mut().queue_dp_read(reg, dst)
    }

    fn queue_dp_write(&mut self, reg: u8, value: u32) -> Result<(), Error> {
        self.borrow_mut().queue_dp_write(reg, value)
    }

    fn queue_ap_read(
        &mut self,
        ap_index: u8,
        reg: u8,
        dst: Option<&ReadSlot>,
    ) -> Result<(), Error> {
        self.borrow_mut().queue_ap_read(ap_index, reg, dst)
    }

    fn queue_ap_write(&mut self, ap_index: u8, reg: u8, value: u32) -> Result<(), Error> {
        self.borrow_mut().queue_ap_write(ap_index, reg, value)
    }

    fn run(&mut self) -> Result<(), Error> {
        self.borrow_mut().run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn fail_after_lets_earlier_ops_through() {
        let mut t = FakeTransport::new(4);
        t.fail_after(1, Error::Fault(0x7));
        t.queue_ap_write(0, ApReg::Csw as u8, 1).unwrap();
        t.queue_ap_write(0, ApReg::Tar as u8, 2).unwrap();
        assert_eq!(t.run(), Err(Error::Fault(0x7)));
    }

    #[test]
    fn fault_latches_once_and_clears_after_run() {
        let mut t = FakeTransport::new(4);
        t.fail_after(0, Error::Wait);
        t.queue_ap_write(0, ApReg::Csw as u8, 1).unwrap();
        assert_eq!(t.run(), Err(Error::Wait));
        assert_eq!(t.run(), Ok(()));
    }
}
