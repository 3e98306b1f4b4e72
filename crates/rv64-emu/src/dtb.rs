//! Builds a flattened device tree (FDT) describing this emulator's fixed hardware layout
//! and hands it to the external `dtc` compiler to produce a DTB blob a guest kernel can
//! parse at boot, the way `riscv-isa-sim` generates one for its `-p`/`-m` virtual platform.
//!
//! Generation is two steps: [`render_dts`] builds the textual DTS from
//! [`crate::primitives::constants`] (so the tree a guest sees always matches the addresses
//! `Bus` actually routes), and [`compile`] shells out to `dtc` to turn that text into a
//! binary blob. [`build`] runs both and returns the blob bytes; this is optional tooling —
//! a DTB can also be supplied pre-built to [`crate::emu::Emu`].

use crate::primitives::constants::{CLINT_BASE, CLINT_SIZE, DRAM_BASE, DRAM_SIZE, PLIC_BASE, UART_BASE, UART_IRQ, VIRTIO_BASE, VIRTIO_IRQ};
use std::io;
use std::path::Path;
use std::process::Command;

pub const DTS_PATH: &str = "rvemu.dts";
pub const DTB_PATH: &str = "rvemu.dtb";

const PLIC_NDEV: u32 = 0x35;
const PLIC_CONTEXT_0: &str = "0x02 0x0b 0x02 0x09";
const CLINT_CONTEXT_0: &str = "0x02 0x03 0x02 0x07";
const CPU_PHANDLE: u32 = 1;
const PLIC_PHANDLE: u32 = 3;

/// Renders the DTS text for a single-hart `riscv-virtio` platform. Every MMIO `reg` entry is
/// interpolated from this crate's own memory map rather than hardcoded, so a change to
/// `primitives::constants` can never silently drift out of sync with what the guest is told.
pub fn render_dts() -> String {
    format!(
        r#"/dts-v1/;

/ {{
    #address-cells = <0x02>;
    #size-cells = <0x02>;
    compatible = "riscv-virtio";
    model = "riscv-virtio,rv64-emu";

    chosen {{
        bootargs = "root=/dev/vda ro console=ttyS0";
        stdout-path = "/uart@{uart_base:x}";
    }};

    uart@{uart_base:x} {{
        interrupts = <{uart_irq:#x}>;
        interrupt-parent = <{plic_phandle}>;
        clock-frequency = <0x384000>;
        reg = <0x0 {uart_base:#x} 0x0 0x100>;
        compatible = "ns16550a";
    }};

    virtio_mmio@{virtio_base:x} {{
        interrupts = <{virtio_irq:#x}>;
        interrupt-parent = <{plic_phandle}>;
        reg = <0x0 {virtio_base:#x} 0x0 0x1000>;
        compatible = "virtio,mmio";
    }};

    cpus {{
        #address-cells = <0x01>;
        #size-cells = <0x00>;
        timebase-frequency = <0x989680>;

        cpu-map {{
            cluster0 {{
                core0 {{
                    cpu = <{cpu_phandle}>;
                }};
            }};
        }};

        cpu@0 {{
            phandle = <{cpu_phandle}>;
            device_type = "cpu";
            reg = <0x00>;
            status = "okay";
            compatible = "riscv";
            riscv,isa = "rv64imac";
            mmu-type = "riscv,sv39";

            interrupt-controller {{
                #interrupt-cells = <0x01>;
                interrupt-controller;
                compatible = "riscv,cpu-intc";
                phandle = <2>;
            }};
        }};
    }};

    memory@{dram_base:x} {{
        device_type = "memory";
        reg = <0x0 {dram_base:#x} 0x0 {dram_size:#x}>;
    }};

    soc {{
        #address-cells = <0x02>;
        #size-cells = <0x02>;
        compatible = "simple-bus";
        ranges;

        interrupt-controller@{plic_base:x} {{
            phandle = <{plic_phandle}>;
            riscv,ndev = <{plic_ndev:#x}>;
            reg = <0x00 {plic_base:#x} 0x00 0x4000000>;
            interrupts-extended = <{plic_context0}>;
            interrupt-controller;
            compatible = "riscv,plic0";
            #interrupt-cells = <0x01>;
            #address-cells = <0x00>;
        }};

        clint@{clint_base:x} {{
            interrupts-extended = <{clint_context0}>;
            reg = <0x00 {clint_base:#x} 0x00 {clint_size:#x}>;
            compatible = "riscv,clint0";
        }};
    }};
}};"#,
        uart_base = UART_BASE,
        uart_irq = UART_IRQ,
        virtio_base = VIRTIO_BASE,
        virtio_irq = VIRTIO_IRQ,
        cpu_phandle = CPU_PHANDLE,
        dram_base = DRAM_BASE,
        dram_size = DRAM_SIZE,
        plic_base = PLIC_BASE,
        plic_phandle = PLIC_PHANDLE,
        plic_ndev = PLIC_NDEV,
        plic_context0 = PLIC_CONTEXT_0,
        clint_base = CLINT_BASE,
        clint_size = CLINT_SIZE,
        clint_context0 = CLINT_CONTEXT_0,
    )
}

/// Writes `dts` to `dts_path` and invokes `dtc` to compile it to `dtb_path`. Requires `dtc`
/// on `PATH`; its own stderr is surfaced as part of the `io::Error` on a nonzero exit so a
/// missing compiler doesn't look like a silent no-op.
fn compile(dts: &str, dts_path: &Path, dtb_path: &Path) -> io::Result<()> {
    std::fs::write(dts_path, dts)?;

    let output = Command::new("dtc")
        .args(["-I", "dts", "-O", "dtb", "-o"])
        .arg(dtb_path)
        .arg(dts_path)
        .output()?;

    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "dtc exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        ));
    }
    Ok(())
}

/// Renders the DTS, compiles it with `dtc`, and reads the resulting DTB back into memory.
pub fn build() -> io::Result<Vec<u8>> {
    let dts_path = Path::new(DTS_PATH);
    let dtb_path = Path::new(DTB_PATH);
    compile(&render_dts(), dts_path, dtb_path)?;
    std::fs::read(dtb_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_dts_embeds_the_real_memory_map() {
        let dts = render_dts();
        assert!(dts.contains(&format!("{:#x}", UART_BASE)));
        assert!(dts.contains(&format!("{:#x}", VIRTIO_BASE)));
        assert!(dts.contains(&format!("{:#x}", CLINT_BASE)));
        assert!(dts.contains(&format!("{:#x}", PLIC_BASE)));
        assert!(dts.contains(&format!("{:#x}", DRAM_BASE)));
    }
}
