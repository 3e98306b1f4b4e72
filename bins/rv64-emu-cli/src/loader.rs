//! Turns a file on disk into the flat DRAM image and entry point `rv64_emu::emu::Emu` wants.
//!
//! Detection is by magic: `\x7fELF` selects a minimal ELF64 program-header loader, anything
//! else is treated as a raw RV64 image copied straight to `DRAM_BASE`.
use anyhow::{bail, ensure, Context, Result};
use rv64_emu::bus::DRAM_BASE;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LSB: u8 = 1;
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;

#[derive(Debug)]
pub struct Loaded {
    /// Bytes to place at `DRAM_BASE`, offset 0 == `DRAM_BASE`.
    pub dram: Vec<u8>,
    /// Physical address the hart should start fetching from.
    pub entry: u64,
}

pub fn load(raw: &[u8]) -> Result<Loaded> {
    if raw.len() >= 4 && &raw[0..4] == ELF_MAGIC {
        load_elf(raw)
    } else {
        Ok(Loaded {
            dram: raw.to_vec(),
            entry: DRAM_BASE,
        })
    }
}

fn load_elf(raw: &[u8]) -> Result<Loaded> {
    ensure!(raw.len() >= 64, "ELF header truncated");
    ensure!(raw[4] == ELF_CLASS_64, "only ELF64 guest images are supported");
    ensure!(raw[5] == ELF_DATA_LSB, "only little-endian guest images are supported");

    let machine = u16::from_le_bytes(raw[18..20].try_into().unwrap());
    ensure!(machine == EM_RISCV, "ELF e_machine {machine} is not EM_RISCV");

    let entry = u64::from_le_bytes(raw[24..32].try_into().unwrap());
    let phoff = u64::from_le_bytes(raw[32..40].try_into().unwrap()) as usize;
    let phentsize = u16::from_le_bytes(raw[54..56].try_into().unwrap()) as usize;
    let phnum = u16::from_le_bytes(raw[56..58].try_into().unwrap()) as usize;

    let mut segments = Vec::new();
    let mut top = 0u64;
    for i in 0..phnum {
        let off = phoff + i * phentsize;
        let ph = raw.get(off..off + 56).context("program header truncated")?;
        let p_type = u32::from_le_bytes(ph[0..4].try_into().unwrap());
        if p_type != PT_LOAD {
            continue;
        }
        let p_offset = u64::from_le_bytes(ph[8..16].try_into().unwrap()) as usize;
        let p_paddr = u64::from_le_bytes(ph[24..32].try_into().unwrap());
        let p_filesz = u64::from_le_bytes(ph[32..40].try_into().unwrap()) as usize;
        let p_memsz = u64::from_le_bytes(ph[40..48].try_into().unwrap());

        if p_paddr < DRAM_BASE {
            bail!("PT_LOAD segment at {p_paddr:#x} lands below DRAM_BASE ({DRAM_BASE:#x})");
        }
        top = top.max(p_paddr - DRAM_BASE + p_memsz);
        segments.push((p_offset, p_paddr, p_filesz, p_memsz));
    }
    ensure!(!segments.is_empty(), "ELF has no PT_LOAD segments");

    let mut dram = vec![0u8; top as usize];
    for (p_offset, p_paddr, p_filesz, _p_memsz) in segments {
        let dst = (p_paddr - DRAM_BASE) as usize;
        let src = raw
            .get(p_offset..p_offset + p_filesz)
            .context("PT_LOAD segment data truncated")?;
        dram[dst..dst + p_filesz].copy_from_slice(src);
    }

    Ok(Loaded { dram, entry })
}
