//! Diagnostic command surface (§6.3): a thin, testable layer over the
//! programmatic API. The `dap-cli` binary is just a `clap` shell around
//! [`execute`]; the logic itself takes no terminal I/O so it can be unit
//! tested directly.

use clap::{Parser, Subcommand};

use crate::dap::Dap;
use crate::error::Error;
use crate::registers::{AP_TYPE_AHB, AP_TYPE_APB, AP_TYPE_AXI, AP_TYPE_JTAG, CSW_SPROT};

/// `dap` command group.
#[derive(Debug, Parser)]
#[command(name = "dap")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print IDR, type, MEM-AP BASE, and the ROM walk for an AP.
    Info {
        /// AP index; defaults to the currently selected AP.
        ap: Option<u32>,
    },
    /// Read and print IDR of an AP, and make it the current AP.
    Apsel {
        ap: Option<u32>,
    },
    /// Print IDR of an AP without changing the current AP.
    Apid {
        ap: Option<u32>,
    },
    /// Toggle the SPROT bit in csw_default for the current AP.
    Apcsw {
        enable: Option<u32>,
    },
    /// Print MEM-AP BASE for an AP.
    Baseaddr {
        ap: Option<u32>,
    },
    /// Get or set memaccess_tck (0..255) for the current AP.
    Memaccess {
        cycles: Option<u32>,
    },
    /// Get or set the DAP-wide TI BE-32 quirk flag.
    TiBe32Quirks {
        enabled: Option<u32>,
    },
}

fn resolve_ap(dap: &Dap, ap: Option<u32>) -> Result<u8, Error> {
    match ap {
        None => Ok(dap.current_ap),
        Some(n) if n < 256 => Ok(n as u8),
        Some(_) => Err(Error::CommandSyntax),
    }
}

fn ap_type_name(idr: u32) -> &'static str {
    match idr & crate::registers::IDR_TYPE_MASK {
        AP_TYPE_JTAG => "JTAG-AP",
        AP_TYPE_AHB => "AHB-AP",
        AP_TYPE_APB => "APB-AP",
        AP_TYPE_AXI => "AXI-AP",
        _ => "Unknown",
    }
}

/// Run one command against `dap`, returning the text the CLI should print.
pub fn execute(dap: &mut Dap, command: Command) -> Result<String, Error> {
    match command {
        Command::Info { ap } => {
            let ap_index = resolve_ap(dap, ap)?;
            let (dbgbase, idr) = dap.get_debugbase(ap_index)?;
            let mut out = format!(
                "AP {ap_index}: IDR=0x{idr:08x} ({})\n  MEM-AP BASE=0x{dbgbase:08x}\n",
                ap_type_name(idr)
            );
            for component in dap.rom_display(ap_index, dbgbase)? {
                out.push_str(&format!(
                    "    0x{:08x} class={:#x} ({}) part=0x{:03x} {} {}\n",
                    component.base_address,
                    component.class,
                    component.class_description(),
                    component.part_num,
                    component.part_type,
                    component.part_full,
                ));
            }
            Ok(out)
        }
        Command::Apsel { ap } => {
            let ap_index = resolve_ap(dap, ap)?;
            let (_, idr) = dap.get_debugbase(ap_index)?;
            dap.current_ap = ap_index;
            Ok(format!("AP {ap_index}: IDR=0x{idr:08x}\n"))
        }
        Command::Apid { ap } => {
            let ap_index = resolve_ap(dap, ap)?;
            let (_, idr) = dap.get_debugbase(ap_index)?;
            Ok(format!("AP {ap_index}: IDR=0x{idr:08x}\n"))
        }
        Command::Apcsw { enable } => {
            let ap_index = dap.current_ap;
            let ap = dap.ap_mut(ap_index);
            match enable {
                Some(0) => ap.csw_default &= !CSW_SPROT,
                Some(_) => ap.csw_default |= CSW_SPROT,
                None => {}
            }
            Ok(format!(
                "AP {ap_index}: SPROT {}\n",
                if dap.ap(ap_index).csw_default & CSW_SPROT != 0 { "on" } else { "off" }
            ))
        }
        Command::Baseaddr { ap } => {
            let ap_index = resolve_ap(dap, ap)?;
            let (dbgbase, _) = dap.get_debugbase(ap_index)?;
            Ok(format!("AP {ap_index}: BASE=0x{dbgbase:08x}\n"))
        }
        Command::Memaccess { cycles } => {
            let ap_index = dap.current_ap;
            if let Some(c) = cycles {
                if c > 255 {
                    return Err(Error::CommandSyntax);
                }
                dap.ap_mut(ap_index).memaccess_tck = c as u8;
            }
            Ok(format!("AP {ap_index}: memaccess_tck={}\n", dap.ap(ap_index).memaccess_tck))
        }
        Command::TiBe32Quirks { enabled } => {
            match enabled {
                Some(0) => dap.set_ti_be_32_quirks(false),
                Some(_) => dap.set_ti_be_32_quirks(true),
                None => {}
            }
            Ok(format!("ti_be_32_quirks={}\n", dap.ti_be_32_quirks))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{IDR_CLASS_MEM_AP, IDR_JEP106_ARM};
    use crate::testing::FakeTransport;

    fn rigged() -> Dap {
        let mut t = FakeTransport::new(0x10000);
        t.ap_idr.insert(0, IDR_JEP106_ARM | IDR_CLASS_MEM_AP | AP_TYPE_AHB);
        t.ap_base.insert(0, 0x1000);
        Dap::new(Box::new(t))
    }

    #[test]
    fn info_prints_idr_base_and_empty_rom_walk() {
        let mut dap = rigged();
        let out = execute(&mut dap, Command::Info { ap: Some(0) }).unwrap();
        assert!(out.contains("AP 0: IDR=0x"));
        assert!(out.contains("AHB-AP"));
        assert!(out.contains("MEM-AP BASE=0x00001000"));
    }

    #[test]
    fn apsel_moves_current_ap() {
        let mut dap = rigged();
        assert_eq!(dap.current_ap, 0);
        execute(&mut dap, Command::Apsel { ap: Some(0) }).unwrap();
        assert_eq!(dap.current_ap, 0);
    }

    #[test]
    fn apid_does_not_move_current_ap() {
        let mut dap = rigged();
        dap.current_ap = 5;
        execute(&mut dap, Command::Apid { ap: Some(0) }).unwrap();
        assert_eq!(dap.current_ap, 5);
    }

    #[test]
    fn apcsw_toggles_sprot() {
        let mut dap = rigged();
        let out = execute(&mut dap, Command::Apcsw { enable: Some(1) }).unwrap();
        assert!(out.contains("SPROT on"));
        assert_ne!(dap.ap(0).csw_default & CSW_SPROT, 0);

        let out = execute(&mut dap, Command::Apcsw { enable: Some(0) }).unwrap();
        assert!(out.contains("SPROT off"));
        assert_eq!(dap.ap(0).csw_default & CSW_SPROT, 0);
    }

    #[test]
    fn baseaddr_reports_debug_base() {
        let mut dap = rigged();
        let out = execute(&mut dap, Command::Baseaddr { ap: Some(0) }).unwrap();
        assert!(out.contains("BASE=0x00001000"));
    }

    #[test]
    fn memaccess_get_and_set() {
        let mut dap = rigged();
        let out = execute(&mut dap, Command::Memaccess { cycles: None }).unwrap();
        assert!(out.contains("memaccess_tck=255"));

        execute(&mut dap, Command::Memaccess { cycles: Some(10) }).unwrap();
        assert_eq!(dap.ap(0).memaccess_tck, 10);
    }

    #[test]
    fn memaccess_rejects_out_of_range_cycles() {
        let mut dap = rigged();
        let err = execute(&mut dap, Command::Memaccess { cycles: Some(256) }).unwrap_err();
        assert_eq!(err, Error::CommandSyntax);
    }

    #[test]
    fn ti_be_32_quirks_get_and_set() {
        let mut dap = rigged();
        execute(&mut dap, Command::TiBe32Quirks { enabled: Some(1) }).unwrap();
        assert!(dap.ti_be_32_quirks);
        let out = execute(&mut dap, Command::TiBe32Quirks { enabled: Some(0) }).unwrap();
        assert!(out.contains("ti_be_32_quirks=false"));
        assert!(!dap.ti_be_32_quirks);
    }

    #[test]
    fn resolve_ap_rejects_out_of_range_index() {
        let dap = rigged();
        assert_eq!(resolve_ap(&dap, Some(256)), Err(Error::CommandSyntax));
        assert_eq!(resolve_ap(&dap, Some(255)), Ok(255));
        assert_eq!(resolve_ap(&dap, None), Ok(dap.current_ap));
    }
}
