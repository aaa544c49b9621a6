//! Burrow runner
//!
//! Boots a guest ELF under the emulator: imports the image into a RamFs
//! root, spawns a process for it, then drives the scheduler until every
//! process has exited (or a tick limit fires).
//!
//! Usage:
//!   burrow-run path/to/guest.elf
//!   burrow-run --swap-dir /tmp/burrow-swap --max-ticks 100000 guest.elf

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use burrow_kernel::{memory, DirSwap, IsaRegistry, Scheduler, VfsFile};
use burrow_vfs::{OpenFlags, RamFs, Vfs};

#[derive(Parser, Debug)]
#[command(name = "burrow-run")]
#[command(about = "Run a guest ELF under the Burrow emulator")]
struct Args {
    /// Guest ELF image to run
    elf: PathBuf,

    /// Back the page pool with one file per page under this directory
    /// instead of host RAM
    #[arg(long)]
    swap_dir: Option<PathBuf>,

    /// Stop after this many scheduler ticks (0 = run to completion)
    #[arg(long, default_value_t = 0)]
    max_ticks: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(dir) = &args.swap_dir {
        let backend = DirSwap::new(dir)
            .with_context(|| format!("cannot use {} as swap directory", dir.display()))?;
        if !memory::init_swap_backend(Box::new(backend)) {
            bail!("page pool already initialized; --swap-dir must be set up front");
        }
    }

    let image = fs::read(&args.elf)
        .with_context(|| format!("cannot read {}", args.elf.display()))?;

    // Stage the image inside the emulator's own filesystem and load it
    // from there, the same path a guest-visible file would take.
    let mut vfs = Vfs::new();
    vfs.mount("/", Box::new(RamFs::new()))?;
    vfs.mkdir("/bin")?;
    let fd = vfs.open("/bin/guest", OpenFlags::WRITE | OpenFlags::CREATE)?;
    vfs.write(fd, &image)?;
    vfs.close(fd)?;

    let registry = IsaRegistry::with_defaults();
    let mut scheduler = Scheduler::new();

    let fd = vfs.open("/bin/guest", OpenFlags::READ)?;
    let pid = {
        let mut file = VfsFile::new(&mut vfs, fd);
        scheduler
            .spawn_elf("guest", &registry, &mut file)
            .with_context(|| format!("cannot load {}", args.elf.display()))?
    };
    vfs.close(fd)?;
    info!("spawned pid {}", pid);

    let mut ticks: u64 = 0;
    let mut instructions: u64 = 0;
    let mut exit_status = None;
    while !scheduler.is_idle() {
        if args.max_ticks != 0 && ticks >= args.max_ticks {
            bail!("guest still running after {} ticks", ticks);
        }
        let report = scheduler.tick(&mut vfs);
        ticks += 1;
        instructions += report.instructions;
        for exit in report.exited {
            info!("pid {} ({}) exited with status {}", exit.pid, exit.name, exit.status);
            if exit.pid == pid {
                exit_status = Some(exit.status);
            }
        }
    }

    println!(
        "guest finished: {} instructions over {} ticks, {} pages still pooled",
        instructions,
        ticks,
        memory::live_pages()
    );
    match exit_status {
        Some(status) => {
            println!("exit status: {}", status);
            Ok(())
        }
        None => bail!("guest was reaped without exiting (fault)"),
    }
}
