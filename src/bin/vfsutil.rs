//! Thin command-line driver for exercising the VFS end to end.

use std::env;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::exit;

use vfscore::{Layout, Vfs};

struct Args {
    volume: PathBuf,
    command: String,
    rest: Vec<String>,
}

fn parse_args() -> Args {
    let mut args = env::args().skip(1);
    let volume = match args.next() {
        Some(v) => PathBuf::from(v),
        None => usage(),
    };
    let command = match args.next() {
        Some(c) => c,
        None => usage(),
    };
    Args {
        volume,
        command,
        rest: args.collect(),
    }
}

fn usage() -> ! {
    eprintln!("usage: vfsutil <volume-dir> <format|write|read|ls|rm|mv> [args...]");
    exit(1);
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let result = match args.command.as_str() {
        "format" => Vfs::format_with_layout(&args.volume, &Layout::default()).map(|_| ()),
        "write" => run_write(&args),
        "read" => run_read(&args),
        "ls" => run_ls(&args),
        "rm" => run_rm(&args),
        "mv" => run_mv(&args),
        other => {
            eprintln!("unknown command: {other}");
            exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("vfsutil: {e}");
        exit(1);
    }
}

fn run_write(args: &Args) -> vfscore::Result<()> {
    let path = args.rest.first().unwrap_or_else(|| usage());
    let vfs = Vfs::mount(&args.volume, Layout::default())?;
    let mut handle = vfs.open(path, "wct")?;
    let mut input = Vec::new();
    io::stdin().read_to_end(&mut input).ok();
    vfs.write(&mut handle, &input)?;
    vfs.close(handle)?;
    vfs.unmount()
}

fn run_read(args: &Args) -> vfscore::Result<()> {
    let path = args.rest.first().unwrap_or_else(|| usage());
    let vfs = Vfs::mount(&args.volume, Layout::default())?;
    let mut handle = vfs.open(path, "r")?;
    let mut buf = [0u8; 4096];
    loop {
        let n = vfs.read(&mut handle, &mut buf)?;
        if n == 0 {
            break;
        }
        io::stdout().write_all(&buf[..n]).ok();
    }
    vfs.close(handle)?;
    vfs.unmount()
}

fn run_ls(args: &Args) -> vfscore::Result<()> {
    let path = args.rest.first().map(String::as_str).unwrap_or("/");
    let vfs = Vfs::mount(&args.volume, Layout::default())?;
    for name in vfs.list(path)? {
        println!("{name}");
    }
    vfs.unmount()
}

fn run_rm(args: &Args) -> vfscore::Result<()> {
    let path = args.rest.first().unwrap_or_else(|| usage());
    let recursive = args.rest.iter().any(|a| a == "-r");
    let vfs = Vfs::mount(&args.volume, Layout::default())?;
    vfs.remove(path, recursive)?;
    vfs.unmount()
}

fn run_mv(args: &Args) -> vfscore::Result<()> {
    if args.rest.len() < 2 {
        usage();
    }
    let vfs = Vfs::mount(&args.volume, Layout::default())?;
    vfs.rename(&args.rest[0], &args.rest[1])?;
    vfs.unmount()
}
