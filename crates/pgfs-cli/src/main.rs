#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use pgfs::{
    DIR_ENTRIES, DIR_NAME_LEN, FileType, FsOps, IMAGE_SIZE, MAX_FILE_SIZE, OpenOptions, PAGE_SIZE,
    PageFs,
};
use pgfs_fuse::MountOptions;
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct InspectOutput {
    page_size: usize,
    page_count: u64,
    image_size: u64,
    max_file_size: u64,
    dir_entries: usize,
    name_max: usize,
    blocks_used: u64,
    blocks_free: u64,
    inodes_used: u64,
    inodes_free: u64,
    root: Vec<RootEntry>,
}

#[derive(Debug, Serialize)]
struct RootEntry {
    name: String,
    inode: u32,
    kind: FileType,
    size: u64,
    nlink: u32,
}

#[derive(Debug, PartialEq, Eq)]
struct MountArgs {
    mountpoint: PathBuf,
    image: PathBuf,
    allow_other: bool,
    read_only: bool,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "mount" => mount_cmd(&parse_mount_args(args.collect())?),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("pgfs\n");
    println!("USAGE:");
    println!("  pgfs inspect <image> [--json]");
    println!("  pgfs mount <mountpoint> [--allow-other] [--read-only] <image>");
}

/// `mount` arguments. The backing image is always the last argument.
fn parse_mount_args(mut args: Vec<String>) -> Result<MountArgs> {
    let Some(image) = args.pop() else {
        bail!("mount requires <mountpoint> <image>");
    };
    let mut mountpoint = None;
    let mut allow_other = false;
    let mut read_only = false;
    for arg in args {
        match arg.as_str() {
            "--allow-other" => allow_other = true,
            "--read-only" => read_only = true,
            flag if flag.starts_with("--") => bail!("unknown mount flag: {flag}"),
            _ if mountpoint.is_some() => bail!("unexpected argument: {arg}"),
            _ => mountpoint = Some(PathBuf::from(arg)),
        }
    }
    let Some(mountpoint) = mountpoint else {
        bail!("mount requires <mountpoint> <image>");
    };
    Ok(MountArgs {
        mountpoint,
        image: PathBuf::from(image),
        allow_other,
        read_only,
    })
}

fn collect_inspect(fs: &PageFs) -> Result<InspectOutput> {
    let stats = fs.statfs().context("statfs")?;
    let mut root = Vec::new();
    for entry in fs.readdir("/").context("read root directory")? {
        let attr = fs
            .getattr(entry.ino)
            .with_context(|| format!("stat /{}", entry.name_str()))?;
        root.push(RootEntry {
            name: entry.name_str(),
            inode: entry.ino.0,
            kind: attr.kind,
            size: attr.size,
            nlink: attr.nlink,
        });
    }
    Ok(InspectOutput {
        page_size: PAGE_SIZE,
        page_count: stats.blocks,
        image_size: IMAGE_SIZE,
        max_file_size: MAX_FILE_SIZE,
        dir_entries: DIR_ENTRIES,
        name_max: DIR_NAME_LEN,
        blocks_used: stats.blocks - stats.blocks_free,
        blocks_free: stats.blocks_free,
        inodes_used: stats.inodes - stats.inodes_free,
        inodes_free: stats.inodes_free,
        root,
    })
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let len = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if len != IMAGE_SIZE {
        bail!(
            "{} is {len} bytes, a PageFS image is {IMAGE_SIZE} bytes",
            path.display()
        );
    }
    let options = OpenOptions {
        create: false,
        ..OpenOptions::default()
    };
    let fs = PageFs::open(path, &options)
        .with_context(|| format!("failed to open PageFS image: {}", path.display()))?;
    let output = collect_inspect(&fs)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("PageFS Inspector");
        println!("page_size: {}", output.page_size);
        println!("page_count: {}", output.page_count);
        println!("max_file_size: {}", output.max_file_size);
        println!(
            "blocks: {} used, {} free",
            output.blocks_used, output.blocks_free
        );
        println!(
            "inodes: {} used, {} free",
            output.inodes_used, output.inodes_free
        );
        println!("root ({} of {} entries):", output.root.len(), output.dir_entries);
        for entry in &output.root {
            println!(
                "  {:>4} {:<11} {:>8} {:>2} {}",
                entry.inode,
                format!("{:?}", entry.kind),
                entry.size,
                entry.nlink,
                entry.name
            );
        }
    }

    Ok(())
}

fn mount_cmd(args: &MountArgs) -> Result<()> {
    let fs = PageFs::open(&args.image, &OpenOptions::default()).with_context(|| {
        format!("failed to open PageFS image: {}", args.image.display())
    })?;
    let stats = fs.statfs().context("statfs")?;
    eprintln!(
        "Mounting PageFS image {} ({} of {} blocks free) at {}",
        args.image.display(),
        stats.blocks_free,
        stats.blocks,
        args.mountpoint.display()
    );

    let opts = MountOptions {
        read_only: args.read_only,
        allow_other: args.allow_other,
        auto_unmount: true,
    };
    let ops: Arc<dyn FsOps> = Arc::new(fs);
    pgfs_fuse::mount(ops, &args.mountpoint, &opts)
        .with_context(|| format!("FUSE mount failed at {}", args.mountpoint.display()))?;

    Ok(())
}
