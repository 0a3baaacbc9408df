use std::env;
use std::process;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tcg_backend::X86_64CodeGen;
use tcg_exec::ExecEnv;
use tcg_frontend::x86_64::cpu::X86Cpu;
use tcg_linux_user::config::Config;
use tcg_linux_user::context::SharedContext;
use tcg_linux_user::guest_space::GuestSpace;
use tcg_linux_user::loader::{load_elf, ElfInfo};
use tcg_linux_user::smc;
use tcg_linux_user::thread::{run_guest, LinuxCpu};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BOX64R_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = Config::from_env();
    if cfg.no_jit {
        warn!("BOX64R_NO_JIT set, but interpreter-only mode is not implemented; running with JIT");
    }

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: tcg-x86_64 <elf> [args...]");
        process::exit(1);
    }

    let elf_path =
        std::fs::canonicalize(&args[1]).expect("failed to resolve elf path");
    let elf_path = elf_path.to_str().unwrap();
    let guest_argv: Vec<&str> = args[1..].iter().map(|s| s.as_str()).collect();

    // Load ELF
    let mut space = GuestSpace::new().expect("failed to create guest space");
    let info: ElfInfo =
        load_elf(std::path::Path::new(elf_path), &mut space, &guest_argv, &[])
            .expect("failed to load ELF");

    info!(elf = elf_path, entry = %format_args!("{:#x}", info.entry), "starting guest");

    // Set up CPU
    let mut cpu = X86Cpu::new();
    cpu.rip = info.entry;
    cpu.gpr[4] = info.sp; // rsp
    cpu.guest_base = space.guest_base() as u64;
    let lcpu = LinuxCpu::new(cpu);

    // mmap_next starts after brk, leaving a 256 MB gap
    let mmap_next = tcg_linux_user::guest_space::page_align_up(info.brk) + 0x1000_0000;

    let show_stats = cfg.stats;
    let mut env = ExecEnv::new(X86_64CodeGen::new());

    let ctx = Arc::new(SharedContext::new(
        env.shared.clone(),
        space,
        mmap_next,
        elf_path.to_string(),
    ));
    ctx.register_image(info.entry, elf_path.to_string(), info.entry);

    {
        let track_ctx = ctx.clone();
        env.shared
            .set_translate_hook(move |tb_idx, pc, guest_size| {
                track_ctx.pages.track(tb_idx, pc, guest_size);
            });
    }
    {
        let invalidate_ctx = ctx.clone();
        smc::install_handler(ctx.space.guest_base(), move |page| {
            for tb_idx in invalidate_ctx.pages.take_page(page) {
                invalidate_ctx.engine.tb_store.invalidate(
                    tb_idx,
                    invalidate_ctx.engine.code_buf(),
                    &invalidate_ctx.engine.backend,
                );
            }
            invalidate_ctx.pages.mark_dirty(page);
        });
    }
    {
        let verify_ctx = ctx.clone();
        env.shared.set_always_verify_hook(move |pc| {
            let page = tcg_linux_user::guest_space::page_align_down(pc);
            verify_ctx.pages.is_dirty(page)
        });
    }
    {
        let fork_ctx = ctx.clone();
        env.shared.set_fork_hook(move |kind| {
            let ret = if kind == 3 {
                fork_ctx.at_fork.do_vfork_and_wait()
            } else {
                fork_ctx.at_fork.do_fork()
            };
            ret as u64
        });
    }

    let code = run_guest(&ctx, env, lcpu, show_stats);
    process::exit(code);
}
