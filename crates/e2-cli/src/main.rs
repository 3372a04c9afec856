#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use e2_core::Ext2Fs;
use e2_error::E2Error;
use e2_image::{FormatOptions, OpenOptions};
use e2_repair::{CheckReport, Finding};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "e2mend",
    version,
    about = "Edit, undelete and repair single-group ext2 images in place"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy a host file into the image.
    Cp {
        /// Path to the filesystem image.
        image: PathBuf,
        /// File on the host to copy.
        source: PathBuf,
        /// Absolute destination path inside the image.
        dest: String,
    },
    /// Create a hard link, or a symbolic link with -s.
    Ln {
        #[arg(short = 's')]
        symbolic: bool,
        image: PathBuf,
        /// Existing absolute path inside the image.
        target: String,
        /// Absolute path of the new link.
        link: String,
    },
    /// Create a directory.
    Mkdir { image: PathBuf, path: String },
    /// Remove a file, or a directory tree with -r.
    Rm {
        #[arg(short = 'r')]
        recursive: bool,
        image: PathBuf,
        path: String,
    },
    /// Bring back a removed entry; directories need -r.
    Restore {
        #[arg(short = 'r')]
        recursive: bool,
        image: PathBuf,
        path: String,
    },
    /// Check the image and repair what is inconsistent.
    Checker {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Write a freshly formatted image.
    Mkfs {
        image: PathBuf,
        #[arg(long, default_value_t = 128)]
        blocks: u32,
        #[arg(long, default_value_t = 32)]
        inodes: u32,
        /// Do not create lost+found.
        #[arg(long)]
        no_lost_found: bool,
        #[arg(long, default_value = "")]
        label: String,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// List a directory.
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        /// Include "." and "..".
        #[arg(short = 'a')]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Write a file's contents to stdout.
    Cat { image: PathBuf, path: String },
    /// Dump superblock, group descriptor, bitmaps and live inodes.
    Inspect {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Cp { .. } => "cp",
            Self::Ln { .. } => "ln",
            Self::Mkdir { .. } => "mkdir",
            Self::Rm { .. } => "rm",
            Self::Restore { .. } => "restore",
            Self::Checker { .. } => "checker",
            Self::Mkfs { .. } => "mkfs",
            Self::Ls { .. } => "ls",
            Self::Cat { .. } => "cat",
            Self::Inspect { .. } => "inspect",
        }
    }
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CheckOutput<'a> {
    findings: &'a [Finding],
    repairs: u32,
    summary: String,
}

#[derive(Debug, Serialize)]
struct LsEntry {
    ino: u32,
    file_type: &'static str,
    name: String,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let name = cli.command.name();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("e2mend {name}: {error:#}");
            ExitCode::from(exit_status(&error))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The errno behind `error`, or 1 when there is none.
fn exit_status(error: &anyhow::Error) -> u8 {
    let errno = if let Some(e) = error.downcast_ref::<E2Error>() {
        e.to_errno()
    } else if let Some(e) = error.downcast_ref::<std::io::Error>() {
        e.raw_os_error().unwrap_or(1)
    } else {
        1
    };
    u8::try_from(errno).ok().filter(|s| *s != 0).unwrap_or(1)
}

fn run(command: Command) -> Result<()> {
    let name = command.name();
    match command {
        Command::Cp {
            image,
            source,
            dest,
        } => {
            let dest = absolute(&dest)?;
            let data = std::fs::read(&source)
                .with_context(|| format!("cannot read {}", source.display()))?;
            let mut fs = open(&image)?;
            fs.copy_in(dest, &data)?;
            fs.flush()?;
        }
        Command::Ln {
            symbolic,
            image,
            target,
            link,
        } => {
            let target = absolute(&target)?;
            let link = absolute(&link)?;
            let mut fs = open(&image)?;
            fs.link(target, link, symbolic)?;
            fs.flush()?;
        }
        Command::Mkdir { image, path } => {
            let path = absolute(&path)?;
            let mut fs = open(&image)?;
            fs.mkdir(path)?;
            fs.flush()?;
        }
        Command::Rm {
            recursive,
            image,
            path,
        } => {
            let path = absolute(&path)?;
            let mut fs = open(&image)?;
            fs.remove(path, recursive)?;
            fs.flush()?;
        }
        Command::Restore {
            recursive,
            image,
            path,
        } => {
            let path = absolute(&path)?;
            let mut fs = open(&image)?;
            fs.restore(path, recursive)?;
            fs.flush()?;
        }
        Command::Checker { image, json } => {
            let mut fs = open(&image)?;
            let report = e2_repair::check(fs.image_mut())?;
            if !report.is_clean() {
                fs.flush()?;
            }
            print_report(&report, json)?;
        }
        Command::Mkfs {
            image,
            blocks,
            inodes,
            no_lost_found,
            label,
            force,
        } => {
            if image.exists() && !force {
                return Err(E2Error::Exists)
                    .with_context(|| format!("{} (use --force)", image.display()));
            }
            let options = FormatOptions {
                blocks_count: blocks,
                inodes_count: inodes,
                lost_and_found: !no_lost_found,
                volume_name: label,
                ..FormatOptions::default()
            };
            let formatted = e2_image::format(&options)?;
            std::fs::write(&image, formatted.into_bytes())
                .with_context(|| format!("cannot write {}", image.display()))?;
        }
        Command::Ls {
            image,
            path,
            all,
            json,
        } => {
            let path = absolute(&path)?;
            let fs = open_read_only(&image)?;
            let entries: Vec<LsEntry> = fs
                .list_dir(path)?
                .into_iter()
                .filter(|e| all || !e.is_dot_or_dotdot())
                .map(|e| LsEntry {
                    ino: e.ino.0,
                    file_type: e.file_type.as_str(),
                    name: e.name_str(),
                })
                .collect();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&entries).context("serialize output")?
                );
            } else {
                for entry in &entries {
                    println!("{:>5} {:<7} {}", entry.ino, entry.file_type, entry.name);
                }
            }
        }
        Command::Cat { image, path } => {
            let path = absolute(&path)?;
            let fs = open_read_only(&image)?;
            let data = fs.read_file(path)?;
            std::io::stdout()
                .lock()
                .write_all(&data)
                .context("write to stdout")?;
        }
        Command::Inspect { image, json } => {
            let fs = open_read_only(&image)?;
            let summary = e2_repair::inspect(fs.image())?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serialize output")?
                );
            } else {
                print!("{summary}");
            }
        }
    }
    info!(target: "e2::cli", command = name, "done");
    Ok(())
}

fn absolute(path: &str) -> Result<&str, E2Error> {
    if path.starts_with('/') {
        Ok(path)
    } else {
        Err(E2Error::InvalidPath(format!(
            "expecting an absolute path, got '{path}'"
        )))
    }
}

fn open(image: &Path) -> Result<Ext2Fs> {
    Ext2Fs::open(image).with_context(|| format!("failed to open image {}", image.display()))
}

fn open_read_only(image: &Path) -> Result<Ext2Fs> {
    let options = OpenOptions { read_only: true };
    Ext2Fs::open_with_options(image, &options)
        .with_context(|| format!("failed to open image {}", image.display()))
}

fn print_report(report: &CheckReport, json: bool) -> Result<()> {
    if json {
        let output = CheckOutput {
            findings: &report.findings,
            repairs: report.repairs(),
            summary: report.summary(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("{report}");
    }
    Ok(())
}
