//! CoreSight AP discovery and ROM-table walking (C7, spec §4.7): finding an
//! AP by type, reading its debug base, recursively locating a component by
//! devtype, and producing a human-readable walk of the whole tree.

use crate::error::Error;
use crate::registers::{ApReg, CID_VALIDITY_MASK, CID_VALIDITY_VALUE, IDR_JEP106_ARM, IDR_JEP106_MASK, IDR_TYPE_MASK};
use crate::transport::ReadSlot;
use crate::dap::Dap;

/// CID class field (bits 15:12) descriptions, ARM IHI 0029B table 3-3.
const CLASS_DESCRIPTION: [&str; 16] = [
    "Reserved", "ROM table", "Reserved", "Reserved",
    "Reserved", "Reserved", "Reserved", "Reserved",
    "Reserved", "CoreSight component", "Reserved", "Peripheral Test Block",
    "Reserved", "OptimoDE DESS",
    "Generic IP component", "PrimeCell or System component",
];

const ANY_ID: u16 = 0x1000;
const ARM_ID: u16 = 0x4BB;

struct PartEntry {
    designer_id: u16,
    part_num: u16,
    part_type: &'static str,
    full: &'static str,
}

/// Known (designer, part number) pairs, from Cortex core specs and the
/// CoreSight components TRM (ARM DDI 0314H). Not exhaustive; an unmatched
/// part reports as "Unrecognized".
const PART_NUMBERS: &[PartEntry] = &[
    PartEntry { designer_id: ARM_ID, part_num: 0x000, part_type: "Cortex-M3 SCS", full: "(System Control Space)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x001, part_type: "Cortex-M3 ITM", full: "(Instrumentation Trace Module)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x002, part_type: "Cortex-M3 DWT", full: "(Data Watchpoint and Trace)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x003, part_type: "Cortex-M3 FPB", full: "(Flash Patch and Breakpoint)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x008, part_type: "Cortex-M0 SCS", full: "(System Control Space)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x00a, part_type: "Cortex-M0 DWT", full: "(Data Watchpoint and Trace)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x00b, part_type: "Cortex-M0 BPU", full: "(Breakpoint Unit)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x00c, part_type: "Cortex-M4 SCS", full: "(System Control Space)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x00d, part_type: "CoreSight ETM11", full: "(Embedded Trace)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x4a1, part_type: "Cortex-A53 ROM", full: "(v8 Memory Map ROM Table)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x4a2, part_type: "Cortex-A57 ROM", full: "(ROM Table)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x4af, part_type: "Cortex-A15 ROM", full: "(ROM Table)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x4c0, part_type: "Cortex-M0+ ROM", full: "(ROM Table)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x4c3, part_type: "Cortex-M3 ROM", full: "(ROM Table)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x4c4, part_type: "Cortex-M4 ROM", full: "(ROM Table)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x4c8, part_type: "Cortex-M7 ROM", full: "(ROM Table)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x906, part_type: "CoreSight CTI", full: "(Cross Trigger)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x907, part_type: "CoreSight ETB", full: "(Trace Buffer)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x908, part_type: "CoreSight CSTF", full: "(Trace Funnel)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x912, part_type: "CoreSight TPIU", full: "(Trace Port Interface Unit)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x913, part_type: "CoreSight ITM", full: "(Instrumentation Trace Macrocell)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x961, part_type: "CoreSight TMC", full: "(Trace Memory Controller)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x962, part_type: "CoreSight STM", full: "(System Trace Macrocell)" },
    PartEntry { designer_id: ARM_ID, part_num: 0x9a0, part_type: "CoreSight PMU", full: "(Performance Monitoring Unit)" },
    PartEntry { designer_id: ARM_ID, part_num: 0xc05, part_type: "Cortex-A5 Debug", full: "(Debug Unit)" },
    PartEntry { designer_id: ARM_ID, part_num: 0xc09, part_type: "Cortex-A9 Debug", full: "(Debug Unit)" },
    PartEntry { designer_id: ARM_ID, part_num: 0xd03, part_type: "Cortex-A53 Debug", full: "(Debug Unit)" },
    PartEntry { designer_id: ARM_ID, part_num: 0xd07, part_type: "Cortex-A57 Debug", full: "(Debug Unit)" },
    PartEntry { designer_id: 0x09f, part_num: 0xcd0, part_type: "Atmel CPU with DSU", full: "(CPU)" },
    PartEntry { designer_id: ANY_ID, part_num: 0x120, part_type: "TI SDTI", full: "(System Debug Trace Interface)" },
    PartEntry { designer_id: ANY_ID, part_num: 0x343, part_type: "TI DAPCTL", full: "" },
];

fn part_lookup(designer_id: u16, part_num: u16) -> (&'static str, &'static str) {
    for entry in PART_NUMBERS {
        if entry.designer_id != designer_id && entry.designer_id != ANY_ID {
            continue;
        }
        if entry.part_num != part_num {
            continue;
        }
        return (entry.part_type, entry.full);
    }
    ("Unrecognized", "")
}

/// Decoded CID/PID pair for one CoreSight component.
#[derive(Debug, Clone)]
pub struct ComponentId {
    pub base_address: u32,
    pub start_address: u32,
    pub component_id: u32,
    pub peripheral_id: u64,
    pub class: u8,
    pub designer_id: u16,
    pub designer_name: Option<&'static str>,
    pub part_num: u16,
    pub part_type: &'static str,
    pub part_full: &'static str,
    /// `(major, minor)` DEVTYPE description, present only for class-9
    /// (CoreSight component) entries.
    pub devtype: Option<(&'static str, &'static str)>,
}

impl ComponentId {
    fn decode(base_address: u32, cid: u32, pid: u64, devtype_raw: Option<u8>) -> Self {
        let class = ((cid >> 12) & 0xF) as u8;
        let part_num = (pid & 0xFFF) as u16;
        let designer_id = (((pid >> 32) & 0xF) as u16) << 8 | (((pid >> 12) & 0xFF) as u16);
        let designer_name = if designer_id & 0x80 != 0 {
            let cc = (designer_id >> 8) as u8;
            let id = (designer_id & 0x7F) as u8;
            let name = jep106::JEP106Code::new(cc, id).get();
            (!name.is_empty()).then_some(name)
        } else if designer_id & 0x7F == 0x41 {
            Some("ARM")
        } else {
            None
        };
        let size = ((pid >> 36) & 0xF) as u32;
        let start_address = base_address.wrapping_sub(0x1000 * size);
        let (part_type, part_full) = part_lookup(designer_id, part_num);
        let devtype = devtype_raw.map(devtype_description);
        ComponentId {
            base_address,
            start_address,
            component_id: cid,
            peripheral_id: pid,
            class,
            designer_id,
            designer_name,
            part_num,
            part_type,
            part_full,
            devtype,
        }
    }

    /// Human-readable class description (ARM IHI 0029B table 3-3).
    pub fn class_description(&self) -> &'static str {
        CLASS_DESCRIPTION[self.class as usize]
    }
}

/// Major/minor DEVTYPE decode for class-9 (CoreSight component) entries.
fn devtype_description(devtype: u8) -> (&'static str, &'static str) {
    let minor = (devtype >> 4) & 0xF;
    match devtype & 0xF {
        0 => ("Miscellaneous", match minor { 0 => "other", 4 => "Validation component", _ => "Reserved" }),
        1 => ("Trace Sink", match minor { 0 => "other", 1 => "Port", 2 => "Buffer", 3 => "Router", _ => "Reserved" }),
        2 => ("Trace Link", match minor { 0 => "other", 1 => "Funnel, router", 2 => "Filter", 3 => "FIFO, buffer", _ => "Reserved" }),
        3 => ("Trace Source", match minor {
            0 => "other", 1 => "Processor", 2 => "DSP", 3 => "Engine/Coprocessor", 4 => "Bus", 6 => "Software", _ => "Reserved",
        }),
        4 => ("Debug Control", match minor { 0 => "other", 1 => "Trigger Matrix", 2 => "Debug Auth", 3 => "Power Requestor", _ => "Reserved" }),
        5 => ("Debug Logic", match minor {
            0 => "other", 1 => "Processor", 2 => "DSP", 3 => "Engine/Coprocessor", 4 => "Bus", 5 => "Memory", _ => "Reserved",
        }),
        6 => ("Performance Monitor", match minor {
            0 => "other", 1 => "Processor", 2 => "DSP", 3 => "Engine/Coprocessor", 4 => "Bus", 5 => "Memory", _ => "Reserved",
        }),
        _ => ("Reserved", "Reserved"),
    }
}

impl Dap {
    /// Scan all 256 APs for the first one whose IDR matches ARM's JEP106
    /// code and `ap_type` (one of the `AP_TYPE_*` constants).
    pub fn find_ap(&mut self, ap_type: u32) -> Result<u8, Error> {
        for ap_num in 0..=255u8 {
            let slot = ReadSlot::new(0);
            if self.queue_ap_read(ap_num, ApReg::Idr as u8, Some(&slot)).is_err() {
                continue;
            }
            if self.run().is_err() {
                continue;
            }
            let idr = slot.get();
            if idr & IDR_JEP106_MASK == IDR_JEP106_ARM && idr & IDR_TYPE_MASK == ap_type {
                tracing::debug!(ap_num, idr, "found matching AP");
                return Ok(ap_num);
            }
        }
        Err(Error::NotFound)
    }

    /// Read `(debug base address, IDR)` for `ap_index`.
    pub fn get_debugbase(&mut self, ap_index: u8) -> Result<(u32, u32), Error> {
        let base_slot = ReadSlot::new(0);
        let idr_slot = ReadSlot::new(0);
        self.queue_ap_read(ap_index, ApReg::Base as u8, Some(&base_slot))?;
        self.queue_ap_read(ap_index, ApReg::Idr as u8, Some(&idr_slot))?;
        self.run()?;
        Ok((base_slot.get(), idr_slot.get()))
    }

    /// Recursively walk the ROM table rooted at `dbgbase` looking for a
    /// component whose DEVTYPE low byte equals `devtype`, skipping the
    /// first `skip` matches. Mirrors the nested-table detection via the
    /// CID1 class nibble (§4.7): an entry whose own CID says "ROM table" is
    /// descended into before being checked against `devtype` itself.
    pub fn lookup_cs_component(
        &mut self,
        ap_index: u8,
        dbgbase: u32,
        devtype: u8,
        skip: &mut i32,
    ) -> Result<u32, Error> {
        let table_base = dbgbase & 0xFFFF_F000;
        let mut entry_offset = 0u32;
        while entry_offset < 0xF00 {
            let romentry = match self.mem_ap_read_atomic_u32(ap_index, table_base | entry_offset) {
                Ok(v) => v,
                Err(_) => {
                    tracing::debug!(ap_index, table_base, entry_offset, "can't read ROM entry, skipping");
                    entry_offset += 4;
                    continue;
                }
            };

            if romentry & 0x1 != 0 {
                let component_base = table_base.wrapping_add(romentry & 0xFFFF_F000);

                match self.mem_ap_read_atomic_u32(ap_index, component_base | 0xFF4) {
                    Ok(cid1) if (cid1 >> 4) & 0xF == 1 => {
                        match self.lookup_cs_component(ap_index, component_base, devtype, skip) {
                            Ok(addr) => return Ok(addr),
                            Err(Error::NotFound) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(_) => {}
                    Err(_) => {
                        tracing::debug!(ap_index, component_base, "can't read component CID, skipping");
                    }
                }

                match self.mem_ap_read_atomic_u32(ap_index, (component_base & 0xFFFF_F000) | 0xFCC) {
                    Ok(this_devtype) => {
                        if (this_devtype & 0xFF) as u8 == devtype {
                            if *skip == 0 {
                                return Ok(component_base);
                            }
                            *skip -= 1;
                        }
                    }
                    Err(_) => {
                        tracing::debug!(ap_index, component_base, "can't read DEVTYPE, skipping");
                    }
                }
            }

            entry_offset += 4;
            if romentry == 0 {
                break;
            }
        }
        Err(Error::NotFound)
    }

    /// Read the 8-word CID/PID pair at `component_base` (which must be
    /// 4K-aligned) and return the packed component and peripheral IDs.
    pub fn read_part_id(&mut self, ap_index: u8, component_base: u32) -> Result<(u32, u64), Error> {
        let pid0 = self.mem_ap_read_atomic_u32(ap_index, component_base + 0xFE0)?;
        let pid1 = self.mem_ap_read_atomic_u32(ap_index, component_base + 0xFE4)?;
        let pid2 = self.mem_ap_read_atomic_u32(ap_index, component_base + 0xFE8)?;
        let pid3 = self.mem_ap_read_atomic_u32(ap_index, component_base + 0xFEC)?;
        let pid4 = self.mem_ap_read_atomic_u32(ap_index, component_base + 0xFD0)?;
        let cid0 = self.mem_ap_read_atomic_u32(ap_index, component_base + 0xFF0)?;
        let cid1 = self.mem_ap_read_atomic_u32(ap_index, component_base + 0xFF4)?;
        let cid2 = self.mem_ap_read_atomic_u32(ap_index, component_base + 0xFF8)?;
        let cid3 = self.mem_ap_read_atomic_u32(ap_index, component_base + 0xFFC)?;

        let cid = (cid3 & 0xFF) << 24 | (cid2 & 0xFF) << 16 | (cid1 & 0xFF) << 8 | (cid0 & 0xFF);
        let pid = (pid4 as u64 & 0xFF) << 32
            | (pid3 as u64 & 0xFF) << 24
            | (pid2 as u64 & 0xFF) << 16
            | (pid1 as u64 & 0xFF) << 8
            | (pid0 as u64 & 0xFF);
        Ok((cid, pid))
    }

    /// Walk the ROM table rooted at `dbgbase`, returning one [`ComponentId`]
    /// per component encountered in depth-first order (§4.7). A component
    /// that can't be read (core powered off) or fails CID validation is
    /// skipped rather than aborting the walk, matching the ROM-table-display
    /// behavior this is grounded on.
    pub fn rom_display(&mut self, ap_index: u8, dbgbase: u32) -> Result<Vec<ComponentId>, Error> {
        let mut out = Vec::new();
        self.rom_display_at(ap_index, dbgbase, 0, &mut out)?;
        Ok(out)
    }

    fn rom_display_at(
        &mut self,
        ap_index: u8,
        dbgbase: u32,
        depth: u32,
        out: &mut Vec<ComponentId>,
    ) -> Result<(), Error> {
        if depth > 16 {
            tracing::warn!(ap_index, dbgbase, "ROM tables nested too deep, stopping walk");
            return Err(Error::Fault(0));
        }

        let base_addr = dbgbase & 0xFFFF_F000;
        let (cid, pid) = match self.read_part_id(ap_index, base_addr) {
            Ok(v) => v,
            Err(_) => {
                tracing::debug!(ap_index, base_addr, "can't read component, core may be off");
                return Ok(());
            }
        };

        if cid & CID_VALIDITY_MASK != CID_VALIDITY_VALUE {
            tracing::debug!(ap_index, base_addr, cid, "invalid component ID");
            return Ok(());
        }

        let class = ((cid >> 12) & 0xF) as u8;
        let devtype_raw = if class == 9 {
            Some((self.mem_ap_read_atomic_u32(ap_index, base_addr | 0xFCC)? & 0xFF) as u8)
        } else {
            None
        };

        let info = ComponentId::decode(base_addr, cid, pid, devtype_raw);
        let is_rom_table = info.class == 1;
        out.push(info);

        if is_rom_table {
            let memtype = self.mem_ap_read_atomic_u32(ap_index, base_addr | 0xFCC)?;
            tracing::debug!(ap_index, base_addr, system_memory = memtype & 0x1 != 0, "MEMTYPE");

            let mut entry_offset = 0u32;
            while entry_offset < 0xF00 {
                let romentry = self.mem_ap_read_atomic_u32(ap_index, base_addr | entry_offset)?;
                if romentry & 0x1 != 0 {
                    self.rom_display_at(ap_index, base_addr + (romentry & 0xFFFF_F000), depth + 1, out)?;
                } else if romentry == 0 {
                    break;
                }
                entry_offset += 4;
            }
        }

        Ok(())
    }
}
