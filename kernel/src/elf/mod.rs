//! ELF loader
//!
//! Loads ELF32-LSB-EXEC images into a guest address space from any
//! seekable byte stream. The loader streams each PT_LOAD segment through
//! a small bounce buffer so hosts never need the whole image in RAM,
//! zero-fills the BSS tail, and reports the entry point and machine type
//! for the ISA dispatcher.
//!
//! Segment permission flags are decoded for diagnostics only; this
//! revision installs no protection bits.

use std::io::{Read, Seek, SeekFrom};

use bitflags::bitflags;
use log::debug;

use crate::error::{KernelError, Result};
use crate::memory::AddressSpace;

/// Size of `e_ident`.
const EI_NIDENT: usize = 16;
/// `e_ident` index of the class byte.
const EI_CLASS: usize = 4;
/// `e_ident` index of the data-encoding byte.
const EI_DATA: usize = 5;

const ELFMAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

/// `e_type` for a static executable.
const ET_EXEC: u16 = 2;
/// `p_type` for a loadable segment.
const PT_LOAD: u32 = 1;

/// Size of an `Elf32_Ehdr`.
const EHDR32_SIZE: usize = 52;
/// Size of an `Elf32_Phdr`.
const PHDR32_SIZE: usize = 32;

/// Bounce buffer for streaming segment bytes.
const CHUNK: usize = 64;

bitflags! {
    /// Segment permission bits from `p_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentPerms: u32 {
        const EXEC = 0x1;
        const WRITE = 0x2;
        const READ = 0x4;
    }
}

/// What the loader reports back for the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// Guest entry point (`e_entry`).
    pub entry: u32,
    /// Machine type (`e_machine`).
    pub machine: u16,
}

/// Load an ELF image from `file` into `space`.
///
/// Rejects anything that is not ELF32 / little-endian / ET_EXEC:
/// - bad magic or wrong class/data/type: `NotExec`
/// - ELF64 (reserved): `Unsupported`
/// - short reads or seek failures: `Io`
/// - pool saturation while mapping segments: `OutOfMemory`
pub fn load<F: Read + Seek>(file: &mut F, space: &mut AddressSpace) -> Result<LoadedImage> {
    file.seek(SeekFrom::Start(0)).map_err(|_| KernelError::Io)?;
    let mut ident = [0u8; EI_NIDENT];
    file.read_exact(&mut ident).map_err(|_| KernelError::Io)?;

    if ident[..4] != ELFMAG {
        return Err(KernelError::NotExec);
    }

    match ident[EI_CLASS] {
        ELFCLASS32 => load_elf32(file, space, &ident),
        ELFCLASS64 => Err(KernelError::Unsupported),
        _ => Err(KernelError::NotExec),
    }
}

fn load_elf32<F: Read + Seek>(
    file: &mut F,
    space: &mut AddressSpace,
    ident: &[u8; EI_NIDENT],
) -> Result<LoadedImage> {
    if ident[EI_DATA] != ELFDATA2LSB {
        return Err(KernelError::NotExec);
    }

    file.seek(SeekFrom::Start(0)).map_err(|_| KernelError::Io)?;
    let mut ehdr = [0u8; EHDR32_SIZE];
    file.read_exact(&mut ehdr).map_err(|_| KernelError::Io)?;

    let e_type = read_u16(&ehdr, 16);
    if e_type != ET_EXEC {
        return Err(KernelError::NotExec);
    }

    let machine = read_u16(&ehdr, 18);
    let entry = read_u32(&ehdr, 24);
    let phoff = read_u32(&ehdr, 28);
    let phentsize = read_u16(&ehdr, 42) as u32;
    let phnum = read_u16(&ehdr, 44);

    if phentsize as usize != PHDR32_SIZE {
        return Err(KernelError::NotExec);
    }

    for i in 0..phnum {
        let offset = phoff as u64 + u64::from(i) * u64::from(phentsize);
        file.seek(SeekFrom::Start(offset)).map_err(|_| KernelError::Io)?;
        let mut phdr = [0u8; PHDR32_SIZE];
        file.read_exact(&mut phdr).map_err(|_| KernelError::Io)?;

        let p_type = read_u32(&phdr, 0);
        if p_type != PT_LOAD {
            continue;
        }

        let p_offset = read_u32(&phdr, 4);
        let p_vaddr = read_u32(&phdr, 8);
        let p_filesz = read_u32(&phdr, 16);
        let p_memsz = read_u32(&phdr, 20);
        let perms = SegmentPerms::from_bits_truncate(read_u32(&phdr, 24));

        debug!(
            "PT_LOAD vaddr={:#010x} filesz={:#x} memsz={:#x} perms={:?}",
            p_vaddr, p_filesz, p_memsz, perms
        );

        load_segment(file, space, p_offset, p_vaddr, p_filesz, p_memsz)?;
    }

    Ok(LoadedImage { entry, machine })
}

/// Stream one PT_LOAD segment into the address space and zero the tail.
fn load_segment<F: Read + Seek>(
    file: &mut F,
    space: &mut AddressSpace,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
) -> Result<()> {
    file.seek(SeekFrom::Start(u64::from(p_offset)))
        .map_err(|_| KernelError::Io)?;

    let mut buf = [0u8; CHUNK];
    let mut done: u32 = 0;
    while done < p_filesz {
        let want = CHUNK.min((p_filesz - done) as usize);
        let got = file.read(&mut buf[..want]).map_err(|_| KernelError::Io)?;
        if got == 0 {
            return Err(KernelError::Io);
        }
        space.memcpy_in(u64::from(p_vaddr) + u64::from(done), &buf[..got])?;
        done += got as u32;
    }

    if p_memsz > p_filesz {
        let tail = (p_memsz - p_filesz) as usize;
        space.memset(u64::from(p_vaddr) + u64::from(p_filesz), 0, tail)?;
    }

    Ok(())
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Assemble a minimal ELF32-LSB-EXEC image in memory.
    pub(crate) fn build_elf(
        machine: u16,
        entry: u32,
        segments: &[(u32, Vec<u8>, u32)], // (vaddr, file bytes, memsz)
    ) -> Vec<u8> {
        let phnum = segments.len();
        let mut image = vec![0u8; EHDR32_SIZE + phnum * PHDR32_SIZE];

        image[..4].copy_from_slice(&ELFMAG);
        image[EI_CLASS] = ELFCLASS32;
        image[EI_DATA] = ELFDATA2LSB;
        image[6] = 1; // EI_VERSION
        image[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&machine.to_le_bytes());
        image[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        image[24..28].copy_from_slice(&entry.to_le_bytes());
        image[28..32].copy_from_slice(&(EHDR32_SIZE as u32).to_le_bytes()); // e_phoff
        image[40..42].copy_from_slice(&(EHDR32_SIZE as u16).to_le_bytes()); // e_ehsize
        image[42..44].copy_from_slice(&(PHDR32_SIZE as u16).to_le_bytes());
        image[44..46].copy_from_slice(&(phnum as u16).to_le_bytes());

        let mut data_offset = image.len() as u32;
        for (i, (vaddr, bytes, memsz)) in segments.iter().enumerate() {
            let base = EHDR32_SIZE + i * PHDR32_SIZE;
            let phdr = &mut image[base..base + PHDR32_SIZE];
            phdr[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
            phdr[4..8].copy_from_slice(&data_offset.to_le_bytes());
            phdr[8..12].copy_from_slice(&vaddr.to_le_bytes());
            phdr[12..16].copy_from_slice(&vaddr.to_le_bytes()); // p_paddr
            phdr[16..20].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
            phdr[20..24].copy_from_slice(&memsz.to_le_bytes());
            phdr[24..28].copy_from_slice(&(SegmentPerms::READ | SegmentPerms::EXEC).bits().to_le_bytes());
            phdr[28..32].copy_from_slice(&4u32.to_le_bytes()); // p_align
            data_offset += bytes.len() as u32;
        }

        for (_, bytes, _) in segments {
            image.extend_from_slice(bytes);
        }
        image
    }

    #[test]
    fn loads_a_segment_and_reports_entry() {
        let text: Vec<u8> = (1..=200u8).collect();
        let image = build_elf(243, 0x1000, &[(0x1000, text.clone(), 200)]);
        let mut space = AddressSpace::new();

        let loaded = load(&mut Cursor::new(image), &mut space).unwrap();
        assert_eq!(loaded.entry, 0x1000);
        assert_eq!(loaded.machine, 243);

        let mut read_back = vec![0u8; 200];
        space.memcpy_out(&mut read_back, 0x1000);
        assert_eq!(read_back, text);
    }

    #[test]
    fn zero_fills_the_bss_tail() {
        // Pre-dirty the region so the zero fill is observable.
        let mut space = AddressSpace::new();
        space.memcpy_in(0x2000, &[0xEE; 600]).unwrap();

        let data: Vec<u8> = vec![0xAB; 100];
        let image = build_elf(243, 0x2000, &[(0x2000, data, 512)]);
        load(&mut Cursor::new(image), &mut space).unwrap();

        assert_eq!(space.read_byte(0x2000 + 99), 0xAB);
        for addr in 0x2000 + 100..0x2000 + 512 {
            assert_eq!(space.read_byte(addr), 0, "at {:#x}", addr);
        }
        // Bytes past memsz stay untouched.
        assert_eq!(space.read_byte(0x2000 + 512), 0xEE);
    }

    #[test]
    fn segment_crossing_many_pages_loads_fully() {
        let big: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let image = build_elf(243, 0x3000, &[(0x30F0, big.clone(), 2000)]);
        let mut space = AddressSpace::new();
        load(&mut Cursor::new(image), &mut space).unwrap();

        let mut read_back = vec![0u8; 2000];
        space.memcpy_out(&mut read_back, 0x30F0);
        assert_eq!(read_back, big);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = build_elf(243, 0, &[]);
        image[3] = 0x00;
        let mut space = AddressSpace::new();
        assert_eq!(
            load(&mut Cursor::new(image), &mut space),
            Err(KernelError::NotExec)
        );
    }

    #[test]
    fn rejects_elf64_as_unsupported() {
        let mut image = build_elf(243, 0, &[]);
        image[EI_CLASS] = ELFCLASS64;
        let mut space = AddressSpace::new();
        assert_eq!(
            load(&mut Cursor::new(image), &mut space),
            Err(KernelError::Unsupported)
        );
    }

    #[test]
    fn rejects_big_endian_and_non_exec() {
        let mut image = build_elf(243, 0, &[]);
        image[EI_DATA] = 2; // ELFDATA2MSB
        let mut space = AddressSpace::new();
        assert_eq!(
            load(&mut Cursor::new(image.clone()), &mut space),
            Err(KernelError::NotExec)
        );

        let mut image = build_elf(243, 0, &[]);
        image[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        assert_eq!(
            load(&mut Cursor::new(image), &mut space),
            Err(KernelError::NotExec)
        );
    }

    #[test]
    fn truncated_image_reports_io() {
        let image = build_elf(243, 0x1000, &[(0x1000, vec![1, 2, 3, 4], 4)]);
        let mut space = AddressSpace::new();
        assert_eq!(
            load(&mut Cursor::new(&image[..image.len() - 2]), &mut space),
            Err(KernelError::Io)
        );
    }
}
