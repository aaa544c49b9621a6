//! End-to-end guest scenarios
//!
//! These tests drive the whole stack the way the runner does: assemble a
//! guest program, wrap it in an ELF32 image, stage it in the VFS, spawn
//! it through the ISA registry, and tick the scheduler until it settles.

use burrow_kernel::config::{EM_RISCV, PAGE_SIZE};
use burrow_kernel::memory::{self, AddressSpace};
use burrow_kernel::{IsaRegistry, KernelError, Scheduler, VfsFile};
use burrow_vfs::{OpenFlags, RamFs, Vfs};

mod rv {
    //! Just enough of an assembler for the scenarios below.

    pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
        ((imm as u32) & 0xFFF) << 20 | rs1 << 15 | rd << 7 | 0b001_0011
    }

    pub fn lui(rd: u32, imm20: u32) -> u32 {
        imm20 << 12 | rd << 7 | 0b011_0111
    }

    pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
        ((imm as u32) & 0xFFF) << 20 | rs1 << 15 | 0b010 << 12 | rd << 7 | 0b000_0011
    }

    pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
        let imm = imm as u32;
        (imm >> 5 & 0x7F) << 25
            | rs2 << 20
            | rs1 << 15
            | 0b010 << 12
            | (imm & 0x1F) << 7
            | 0b010_0011
    }

    pub fn ecall() -> u32 {
        0x0000_0073
    }

    /// `jal x0, -4`
    pub fn jal_back() -> u32 {
        0xFFDF_F06F
    }

    pub fn words(program: &[u32]) -> Vec<u8> {
        program.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

mod elf {
    //! Minimal ELF32-LSB-EXEC writer for test images.

    const EHDR_SIZE: usize = 52;
    const PHDR_SIZE: usize = 32;

    pub fn build(machine: u16, entry: u32, segments: &[(u32, Vec<u8>, u32)]) -> Vec<u8> {
        let phnum = segments.len();
        let mut image = vec![0u8; EHDR_SIZE + phnum * PHDR_SIZE];

        image[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        image[4] = 1; // ELFCLASS32
        image[5] = 1; // ELFDATA2LSB
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&machine.to_le_bytes());
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..28].copy_from_slice(&entry.to_le_bytes());
        image[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes());
        image[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        image[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image[44..46].copy_from_slice(&(phnum as u16).to_le_bytes());

        let mut data_offset = image.len() as u32;
        for (i, (vaddr, bytes, memsz)) in segments.iter().enumerate() {
            let base = EHDR_SIZE + i * PHDR_SIZE;
            let phdr = &mut image[base..base + PHDR_SIZE];
            phdr[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            phdr[4..8].copy_from_slice(&data_offset.to_le_bytes());
            phdr[8..12].copy_from_slice(&vaddr.to_le_bytes());
            phdr[12..16].copy_from_slice(&vaddr.to_le_bytes());
            phdr[16..20].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
            phdr[20..24].copy_from_slice(&memsz.to_le_bytes());
            phdr[24..28].copy_from_slice(&5u32.to_le_bytes()); // R + X
            phdr[28..32].copy_from_slice(&4u32.to_le_bytes());
            data_offset += bytes.len() as u32;
        }
        for (_, bytes, _) in segments {
            image.extend_from_slice(bytes);
        }
        image
    }
}

const ENTRY: u32 = 0x1_0000;

fn fresh_vfs() -> Vfs {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut vfs = Vfs::new();
    vfs.mount("/", Box::new(RamFs::new())).unwrap();
    vfs
}

/// Stage `image` in the VFS and spawn it through a descriptor, the way
/// the runner boots guests.
fn spawn_image(sched: &mut Scheduler, vfs: &mut Vfs, image: &[u8]) -> u32 {
    let registry = IsaRegistry::with_defaults();
    let fd = vfs
        .open("/guest", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE)
        .unwrap();
    vfs.write(fd, image).unwrap();
    let pid = {
        let mut file = VfsFile::new(vfs, fd);
        sched.spawn_elf("guest", &registry, &mut file).unwrap()
    };
    vfs.close(fd).unwrap();
    vfs.remove("/guest").unwrap();
    pid
}

fn run_to_exit(sched: &mut Scheduler, vfs: &mut Vfs, pid: u32) -> u32 {
    for _ in 0..10_000 {
        let report = sched.tick(vfs);
        if let Some(exit) = report.exited.iter().find(|e| e.pid == pid) {
            return exit.status;
        }
        assert!(!sched.is_idle(), "guest was reaped without exiting");
    }
    panic!("guest did not exit within the tick budget");
}

#[test]
fn minimal_exit() {
    // li a0, 7; li a7, 0; ecall
    let program = [rv::addi(10, 0, 7), rv::addi(17, 0, 0), rv::ecall()];
    let image = elf::build(EM_RISCV, ENTRY, &[(ENTRY, rv::words(&program), 12)]);

    let mut vfs = fresh_vfs();
    let mut sched = Scheduler::new();
    let pid = spawn_image(&mut sched, &mut vfs, &image);

    assert_eq!(run_to_exit(&mut sched, &mut vfs, pid), 7);
    assert!(sched.is_idle());
    assert_eq!(sched.tick(&mut vfs).instructions, 0);
}

#[test]
fn guest_reads_a_file_and_exits_with_its_contents() {
    // The guest opens /msg, reads a 4-byte little-endian word and exits
    // with it as the status.
    let path_addr = 0x2_0000;
    let buf_addr = 0x3_0000;
    let program = [
        rv::lui(10, path_addr >> 12),  // a0 = &"/msg"
        rv::addi(11, 0, 0),            // a1 = O_RDONLY
        rv::addi(17, 0, 1),            // a7 = OPEN
        rv::ecall(),                   // a0 = fd
        rv::lui(11, buf_addr >> 12),   // a1 = buf
        rv::addi(12, 0, 4),            // a2 = 4
        rv::addi(17, 0, 2),            // a7 = READ
        rv::ecall(),                   // a0 = bytes read
        rv::lui(5, buf_addr >> 12),
        rv::lw(10, 5, 0),              // a0 = *buf
        rv::addi(17, 0, 0),            // a7 = EXIT
        rv::ecall(),
    ];
    let mut path = b"/msg\0".to_vec();
    path.resize(8, 0);
    let image = elf::build(
        EM_RISCV,
        ENTRY,
        &[
            (ENTRY, rv::words(&program), rv::words(&program).len() as u32),
            (path_addr, path, 8),
        ],
    );

    let mut vfs = fresh_vfs();
    let fd = vfs
        .open("/msg", OpenFlags::WRITE | OpenFlags::CREATE)
        .unwrap();
    vfs.write(fd, &12345u32.to_le_bytes()).unwrap();
    vfs.close(fd).unwrap();

    let mut sched = Scheduler::new();
    let pid = spawn_image(&mut sched, &mut vfs, &image);
    assert_eq!(run_to_exit(&mut sched, &mut vfs, pid), 12345);
}

#[test]
fn page_faulting_store_maps_the_page() {
    // sw 0xDEADBEEF -> 0x4000_0000 (initially unmapped), then spin.
    let program = [
        rv::lui(5, 0x40000),       // t0 = 0x4000_0000
        rv::lui(6, 0xDEADC),
        rv::addi(6, 6, -0x111),    // t1 = 0xDEADBEEF
        rv::sw(6, 5, 0),
        rv::addi(0, 0, 0),
        rv::jal_back(),
    ];
    let image = elf::build(EM_RISCV, ENTRY, &[(ENTRY, rv::words(&program), 24)]);

    let mut vfs = fresh_vfs();
    let mut sched = Scheduler::new();
    let pid = spawn_image(&mut sched, &mut vfs, &image);

    sched.tick(&mut vfs);

    let proc = sched.process_mut(pid).unwrap();
    let space = proc.space_mut();
    assert!(space.lookup(0x4000_0000).is_some());
    let mut word = [0u8; 4];
    space.memcpy_out(&mut word, 0x4000_0000);
    assert_eq!(u32::from_le_bytes(word), 0xDEAD_BEEF);
}

#[test]
fn scheduler_swap_cycle_preserves_guest_pages() {
    // A spinning guest whose data pages must survive the swap-out /
    // swap-in bracket around every window.
    let program = [rv::addi(0, 0, 0), rv::jal_back()];
    let image = elf::build(EM_RISCV, ENTRY, &[(ENTRY, rv::words(&program), 8)]);

    let mut vfs = fresh_vfs();
    let mut sched = Scheduler::new();
    let pid = spawn_image(&mut sched, &mut vfs, &image);

    // Scatter a recognizable pattern over a few dozen pages.
    {
        let space = sched.process_mut(pid).unwrap().space_mut();
        for i in 0..48u64 {
            let addr = 0x500_0000 + i * PAGE_SIZE as u64;
            space.memcpy_in(addr, &[(i % 256) as u8]).unwrap();
        }
    }

    for _ in 0..3 {
        sched.tick(&mut vfs);
    }

    let space = sched.process_mut(pid).unwrap().space_mut();
    for i in 0..48u64 {
        let addr = 0x500_0000 + i * PAGE_SIZE as u64;
        assert_eq!(space.read_byte(addr), (i % 256) as u8, "page {}", i);
    }
}

#[test]
fn many_pages_survive_a_full_swap_round_trip() {
    let mut space = AddressSpace::new();
    let pages = 200u64;
    for i in 0..pages {
        space
            .memcpy_in(i * PAGE_SIZE as u64, &[(i % 256) as u8])
            .unwrap();
    }
    space.swap_out_all().unwrap();
    for i in 0..pages {
        let id = space.lookup(i * PAGE_SIZE as u64).unwrap();
        assert!(memory::is_swapped(id));
    }
    space.swap_in_all().unwrap();
    for i in 0..pages {
        assert_eq!(space.read_byte(i * PAGE_SIZE as u64), (i % 256) as u8);
    }
}

#[test]
fn bad_magic_is_rejected_as_not_executable() {
    let mut image = elf::build(EM_RISCV, ENTRY, &[]);
    image[3] = 0x00; // "\x7FEL\0"

    let registry = IsaRegistry::with_defaults();
    let mut space = AddressSpace::new();
    let result = registry.thread_for_elf(&mut std::io::Cursor::new(image), &mut space);
    assert!(matches!(result, Err(KernelError::NotExec)));
}

#[test]
fn unregistered_machine_is_rejected_after_a_clean_load() {
    let program = [rv::ecall()];
    let image = elf::build(0x1234, ENTRY, &[(ENTRY, rv::words(&program), 4)]);

    let registry = IsaRegistry::with_defaults();
    let mut space = AddressSpace::new();
    let result = registry.thread_for_elf(&mut std::io::Cursor::new(image), &mut space);
    assert!(matches!(result, Err(KernelError::Unsupported)));
}

#[test]
fn faulting_guest_is_reaped() {
    let program = [0xFFFF_FFFFu32]; // undecodable
    let image = elf::build(EM_RISCV, ENTRY, &[(ENTRY, rv::words(&program), 4)]);

    let mut vfs = fresh_vfs();
    let mut sched = Scheduler::new();
    let pid = spawn_image(&mut sched, &mut vfs, &image);
    assert_eq!(sched.process(pid).unwrap().thread_count(), 1);

    let report = sched.tick(&mut vfs);
    assert!(report.exited.is_empty());
    assert!(sched.process(pid).is_none());
    assert!(sched.is_idle());
}
