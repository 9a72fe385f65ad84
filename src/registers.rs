//! Bit-exact register layout constants (spec §6.4). These are load-bearing:
//! get a bit position wrong here and every other module is wrong with it.

/// Debug Port register selectors (bank 0, DPBANKSEL implied 0 unless noted).
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DpReg {
    /// Write-only: clears sticky errors and aborts a stalled transaction.
    Abort = 0x0,
    /// Link control/status; also where the power-up handshake lives.
    CtrlStat = 0x4,
    /// Selects the active AP and its register bank.
    Select = 0x8,
    /// Read-buffer for the result of the previous read.
    Rdbuff = 0xC,
}

/// MEM-AP register selectors within the currently selected bank.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApReg {
    /// Control/Status Word.
    Csw = 0x00,
    /// Transfer Address Register.
    Tar = 0x04,
    /// Data Read/Write.
    Drw = 0x0C,
    /// Banked Data window 0 (..3 follow at +4 each).
    Bd0 = 0x10,
    /// Banked Data window 1.
    Bd1 = 0x14,
    /// Banked Data window 2.
    Bd2 = 0x18,
    /// Banked Data window 3.
    Bd3 = 0x1C,
    /// Configuration register (large data / long address / big-endian bits).
    Cfg = 0xF4,
    /// Debug base address.
    Base = 0xF8,
    /// Identification register.
    Idr = 0xFC,
}

/// Returns `BD0 | (addr & 0xC)`, selecting the banked-data window that
/// aliases `addr`'s 16-byte-aligned window without touching TAR (§4.4).
pub fn banked_data_reg(addr: u32) -> u8 {
    (ApReg::Bd0 as u8) | ((addr & 0xC) as u8)
}

// --- CSW bits -------------------------------------------------------------

/// Software access enable; required for a debugger-initiated transfer.
pub const CSW_DBGSWENABLE: u32 = 1 << 31;
/// Privileged-debug bit.
pub const CSW_MASTER_DEBUG: u32 = 1 << 29;
/// Privileged (HPROT[1]) access.
pub const CSW_HPROT1: u32 = 1 << 25;
/// Secure-privileged (SPROT) access; user-controllable via `csw_default`.
pub const CSW_SPROT: u32 = 1 << 30;

/// Size field mask, bits [2:0].
pub const CSW_SIZE_MASK: u32 = 0x7;
/// 8-bit transfer size.
pub const CSW_8BIT: u32 = 0b000;
/// 16-bit transfer size.
pub const CSW_16BIT: u32 = 0b001;
/// 32-bit transfer size.
pub const CSW_32BIT: u32 = 0b010;

/// Address-increment field mask, bits [5:4].
pub const CSW_ADDRINC_MASK: u32 = 0b11 << 4;
/// TAR does not advance after a transfer.
pub const CSW_ADDRINC_OFF: u32 = 0b00 << 4;
/// TAR advances by the transfer size after each transfer.
pub const CSW_ADDRINC_SINGLE: u32 = 0b01 << 4;
/// TAR advances by 4 regardless of transfer size (sub-word lane packing).
pub const CSW_ADDRINC_PACKED: u32 = 0b10 << 4;

// --- CTRL/STAT bits --------------------------------------------------------

/// Enables detection of pipeline overrun (SSTICKYORUN).
pub const CTRLSTAT_CORUNDETECT: u32 = 1 << 0;
/// Sticky overrun latch: a queued access overtook a pending one.
pub const CTRLSTAT_SSTICKYORUN: u32 = 1 << 1;
/// Sticky error latch: an AP/DP transaction faulted.
pub const CTRLSTAT_SSTICKYERR: u32 = 1 << 5;
/// Request debug power domain.
pub const CTRLSTAT_CDBGPWRUPREQ: u32 = 1 << 28;
/// Debug power domain acknowledged powered.
pub const CTRLSTAT_CDBGPWRUPACK: u32 = 1 << 29;
/// Request system power domain.
pub const CTRLSTAT_CSYSPWRUPREQ: u32 = 1 << 30;
/// System power domain acknowledged powered.
pub const CTRLSTAT_CSYSPWRUPACK: u32 = 1 << 31;

/// Mask of bits that indicate *some* sticky fault is latched.
pub const CTRLSTAT_ANY_STICKY_ERROR: u32 = CTRLSTAT_SSTICKYERR | CTRLSTAT_SSTICKYORUN;

// --- IDR fields --------------------------------------------------------

/// JEP106 field mask, bits [27:17].
pub const IDR_JEP106_MASK: u32 = 0x7FF << 17;
/// ARM's JEP106 code, pre-shifted into IDR position.
pub const IDR_JEP106_ARM: u32 = 0x23B << 17;
/// Class field mask, bits [16:13].
pub const IDR_CLASS_MASK: u32 = 0xF << 13;
/// MEM-AP class value, pre-shifted into IDR position.
pub const IDR_CLASS_MEM_AP: u32 = 0x8 << 13;
/// AP type field mask, bits [3:0].
pub const IDR_TYPE_MASK: u32 = 0xF;

/// AP type: JTAG bridge.
pub const AP_TYPE_JTAG: u32 = 0;
/// AP type: AHB bus bridge.
pub const AP_TYPE_AHB: u32 = 1;
/// AP type: APB bus bridge.
pub const AP_TYPE_APB: u32 = 2;
/// AP type: AXI bus bridge.
pub const AP_TYPE_AXI: u32 = 4;

/// CoreSight component Component ID, expected once bits 15:12 (class) are masked out.
pub const CID_VALIDITY_MASK: u32 = 0xFFFF_0FFF;
/// Expected masked value for any valid CoreSight component.
pub const CID_VALIDITY_VALUE: u32 = 0xB105_000D;
