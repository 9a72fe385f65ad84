//! Small diagnostic binary wrapping the §6.3 command surface in `clap`,
//! analogous to the teacher's `parse-rom-table`/`peekpoke` examples but
//! driven against the in-crate demo transport rather than a concrete cable
//! (the cable itself is out of scope for this crate).

use clap::Parser;

use adiv5_dap::cli::{execute, Cli};
use adiv5_dap::dap::Dap;
use adiv5_dap::registers::{IDR_CLASS_MEM_AP, IDR_JEP106_ARM};
use adiv5_dap::testing::FakeTransport;

/// Build a small fake target for demo purposes: one MEM-AP (index 0) backed
/// by 4 KiB of memory with a one-entry ROM table at its debug base.
///
/// Each CID/PID byte lives in the low byte of its own word register, 4
/// bytes apart, the way `read_part_id` fetches them - not packed as
/// sequential bytes of one word.
fn demo_transport() -> FakeTransport {
    let mut t = FakeTransport::new(4096);
    t.ap_idr.insert(0, IDR_JEP106_ARM | IDR_CLASS_MEM_AP | 0x1 /* AHB-AP */);
    t.ap_base.insert(0, 0x0000);

    // CID = 0xB105_900D: valid CoreSight component, class 9.
    t.memory[0xFF0] = 0x0D;
    t.memory[0xFF4] = 0x90;
    t.memory[0xFF8] = 0x05;
    t.memory[0xFFC] = 0xB1;

    // PID encodes designer 0x4BB (ARM) and part number 0xC05
    // (Cortex-A5 Debug, per `PART_NUMBERS`), size field 0.
    t.memory[0xFE0] = 0x05;
    t.memory[0xFE4] = 0xBC;
    t.memory[0xFE8] = 0x0B;
    t.memory[0xFEC] = 0x00;
    t.memory[0xFD0] = 0x04;

    // DEVTYPE at the component's base + 0xFCC: Debug Control, other.
    t.memory[0xFCC] = 0x04;

    t
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut dap = Dap::new(Box::new(demo_transport()));
    dap.dap_dp_init()?;
    dap.mem_ap_init(0)?;

    print!("{}", execute(&mut dap, cli.command)?);
    Ok(())
}
