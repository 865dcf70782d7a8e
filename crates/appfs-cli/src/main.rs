#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use appfs_engine::{Fs, Reachability, SegmentGlyph};
use appfs_types::{BlockPos, InodeId};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "appfs", about = "AppFS — a packaged application filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a blank application package.
    Create {
        /// Path of the image to create.
        image: PathBuf,
        /// Application name stored in the package header.
        #[arg(long, default_value = "Test Application")]
        app_name: String,
        /// Application version string.
        #[arg(long, default_value = "1.0.0")]
        app_version: String,
        /// Application description.
        #[arg(long, default_value = "A test package.")]
        description: String,
        /// Application author.
        #[arg(long, default_value = "AppTools")]
        author: String,
    },
    /// Show the package header.
    Info {
        /// Path to the image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List the children of a directory inode. Use id 0 for the root.
    Children {
        /// Path to the image.
        image: PathBuf,
        /// Inode id of the directory.
        id: u16,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Display the type of every block in the package.
    Segments {
        /// Path to the image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Reclaim temporary, invalid, and unreachable blocks.
    Clean {
        /// Path to the image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Hex-dump one block by index.
    Show {
        /// Path to the image.
        image: PathBuf,
        /// Zero-based block index.
        block: u32,
    },
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Create {
            image,
            app_name,
            app_version,
            description,
            author,
        } => create(&image, &app_name, &app_version, &description, &author),
        Command::Info { image, json } => info(&image, json),
        Command::Children { image, id, json } => children(&image, id, json),
        Command::Segments { image, json } => segments(&image, json),
        Command::Clean { image, json } => clean(&image, json),
        Command::Show { image, block } => show(&image, block),
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn create(
    image: &Path,
    app_name: &str,
    app_version: &str,
    description: &str,
    author: &str,
) -> Result<()> {
    Fs::create_image(image, app_name, app_version, description, author)
        .with_context(|| format!("create package {}", image.display()))?;
    println!("Package successfully created at {}.", image.display());
    Ok(())
}

fn info(image: &Path, json: bool) -> Result<()> {
    let fs = open(image)?;
    let header = fs.fsinfo();

    if json {
        println!("{}", serde_json::to_string_pretty(header).context("serialize header")?);
        return Ok(());
    }

    println!("Filesystem Name: {}", header.fs_name);
    println!(
        "Filesystem Version: {}.{}.{}",
        header.ver_major, header.ver_minor, header.ver_revision
    );
    println!("Application Name: {}", header.app_name);
    println!("Application Version: {}", header.app_version);
    println!("Application Description: {}", header.app_description);
    println!("Application Author: {}", header.app_author);
    println!("Position of root directory inode: {}", header.pos_root);
    println!("Position of freelist inode: {}", header.pos_freelist);
    Ok(())
}

#[derive(Debug, Serialize)]
struct ChildOutput {
    id: u16,
    kind: appfs_types::BlockKind,
    name: Option<String>,
}

fn children(image: &Path, id: u16, json: bool) -> Result<()> {
    let mut fs = open(image)?;
    let nodes = fs
        .get_children_of_directory(InodeId(id))
        .with_context(|| format!("list children of inode {id}"))?;

    let rows: Vec<ChildOutput> = nodes
        .iter()
        .map(|node| ChildOutput {
            id: node.inode_id().map_or(0, |id| id.0),
            kind: node.kind(),
            name: node.name().map(str::to_owned),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows).context("serialize children")?);
        return Ok(());
    }

    println!("Children of directory with inode {id}:");
    for row in rows {
        match row.name {
            Some(name) => println!(" * {} ({}, {})", row.id, row.kind, name),
            None => println!(" * {} ({})", row.id, row.kind),
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct SegmentsOutput {
    header_blocks: usize,
    data_blocks: usize,
    malformed_blocks: u64,
    map: String,
}

fn segments(image: &Path, json: bool) -> Result<()> {
    let mut fs = open(image)?;
    let reach: Reachability = fs.reachability().context("walk the image")?;
    let map = fs.segment_map(&reach).context("classify blocks")?;

    if json {
        let out = SegmentsOutput {
            header_blocks: reach.headers.len(),
            data_blocks: reach.data.len(),
            malformed_blocks: reach.malformed_blocks,
            map: map
                .iter()
                .map(|g| if g.unreachable { '!' } else { g.glyph })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&out).context("serialize segments")?);
        return Ok(());
    }

    println!("_ = free block          F = file info       S = segment info");
    println!("# = data                D = directory       L = symbolic link");
    println!("T = temporary data      % = freelist        I = filesystem info");
    println!("? = invalid               = unset");
    println!("! = inaccessible (will be removed by the clean operation)");
    println!();
    println!("Header blocks: {}", reach.headers.len());
    println!("Data blocks: {}", reach.data.len());
    if reach.malformed_blocks > 0 {
        println!("Malformed blocks: {}", reach.malformed_blocks);
    }
    println!();
    render_map(&map);
    Ok(())
}

fn render_map(map: &[SegmentGlyph]) {
    println!("/===============================================================\\");
    for row in map.chunks(16) {
        let mut line = String::from("|");
        for glyph in row {
            if glyph.unreachable {
                line.push_str(&format!(" {}!|", glyph.glyph));
            } else {
                line.push_str(&format!(" {} |", glyph.glyph));
            }
        }
        println!("{line}");
    }
    println!("\\===============================================================/");
}

fn clean(image: &Path, json: bool) -> Result<()> {
    let mut fs = open(image)?;
    let report = fs.clean().context("clean the image")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report).context("serialize report")?);
    } else {
        println!("{report}");
    }
    Ok(())
}

fn show(image: &Path, block: u32) -> Result<()> {
    let mut fs = open(image)?;
    let pos = BlockPos::from_index(block).context("block index out of range")?;
    let bytes = fs
        .read_raw_block(pos)
        .with_context(|| format!("read block {block}"))?;

    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
        let text: String = chunk
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!(
            "{:08X}  {:<47}  {}",
            pos.byte_offset() + (row * 16) as u64,
            hex.join(" "),
            text
        );
    }
    Ok(())
}

fn open(image: &Path) -> Result<Fs> {
    Fs::open(image).with_context(|| format!("open {}", image.display()))
}
