#![forbid(unsafe_code)]
//! The privileged helper binary.
//!
//! Speaks a line-oriented request/response protocol on stdin/stdout: one
//! command per line, JSON result records, then an `OK 200` or
//! `ERR <status> <message>` terminator. Diagnostics go to stderr only —
//! stdout belongs to the protocol.

use anyhow::Context;
use btq_core::{KernelTrees, MountTable, TypeFilter, devices, space, subvol, vfs};
use btq_error::HelperError;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if btq_core::effective_uid() != 0 {
        println!("ERR 550 Root helper not running as root");
        let _ = io::stdout().flush();
        std::process::exit(1);
    }
    println!("OK 200 Ready");
    let _ = io::stdout().flush();

    let table = Arc::new(MountTable::system());
    let outcome = serve(&table, io::stdin().lock(), io::stdout().lock());
    // All mounts are ephemeral; tear them down however the loop ended.
    table.cleanup();

    if let Err(error) = outcome {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn serve(
    table: &Arc<MountTable>,
    reader: impl BufRead,
    mut out: impl Write,
) -> anyhow::Result<()> {
    for line in reader.lines() {
        let line = line.context("reading request line")?;
        if line.is_empty() {
            break;
        }

        let tokens = tokenize(&line);
        let Some((command, args)) = tokens.split_first() else {
            writeln!(out, "ERR 501 Command not known")?;
            out.flush()?;
            continue;
        };
        if command == "quit" {
            break;
        }

        match dispatch(table, command, args, &mut out) {
            None => writeln!(out, "ERR 501 Command not known")?,
            Some(Ok(())) => writeln!(out, "OK 200 All good")?,
            Some(Err(err)) => {
                tracing::error!(%command, %err, "request failed");
                writeln!(out, "ERR {} {}", err.to_status(), err)?;
            }
        }
        out.flush()?;
    }
    Ok(())
}

/// Split a request line into tokens. Tokens are separated by runs of
/// spaces; a backslash escapes the next character, so names containing
/// spaces survive the trip.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            ' ' if in_token => {
                tokens.push(std::mem::take(&mut current));
                in_token = false;
            }
            ' ' => {}
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                    in_token = true;
                }
            }
            other => {
                current.push(other);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

type CmdResult = Result<(), HelperError>;

/// Route one request. `None` means the command name itself is unknown.
fn dispatch(
    table: &Arc<MountTable>,
    command: &str,
    args: &[String],
    out: &mut impl Write,
) -> Option<CmdResult> {
    Some(match command {
        "scan" => cmd_scan(out),
        "df" => cmd_df(table, args, out),
        "vol_df" => cmd_vol_df(table, args, out),
        "sub_list" => cmd_sub_list(table, args, out),
        "sub_make" => cmd_sub_make(table, args),
        "sub_del" => cmd_sub_del(table, args),
        "sub_snap" => cmd_sub_snap(table, args),
        "sub_def" => cmd_sub_def(table, args),
        "ls" => cmd_ls(table, args, out),
        "dev_add" => cmd_dev_add(table, args),
        "dev_del" => cmd_dev_del(table, args),
        _ => return None,
    })
}

/// Exactly `N` arguments or a usage error.
fn fixed_args<'a, const N: usize>(
    args: &'a [String],
    usage: &str,
) -> Result<[&'a str; N], HelperError> {
    if args.len() != N {
        return Err(HelperError::InvalidRequest {
            reason: format!("usage: {usage}"),
        });
    }
    let mut out = [""; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg.as_str();
    }
    Ok(out)
}

fn parse_u64(value: &str, what: &str) -> Result<u64, HelperError> {
    value.parse().map_err(|_| HelperError::InvalidRequest {
        reason: format!("{what} must be an unsigned integer, got {value:?}"),
    })
}

fn emit<T: serde::Serialize>(out: &mut impl Write, value: &T) -> CmdResult {
    let json = serde_json::to_string(value)
        .map_err(|e| HelperError::Io(io::Error::other(e)))?;
    writeln!(out, "{json}")?;
    Ok(())
}

fn cmd_scan(out: &mut impl Write) -> CmdResult {
    let filesystems = devices::scan()?;
    emit(out, &filesystems)
}

fn cmd_df(table: &Arc<MountTable>, args: &[String], out: &mut impl Write) -> CmdResult {
    let [uuid] = fixed_args(args, "df <uuid>")?;
    let handle = table.acquire(uuid)?;
    let records = space::df(&handle)?;
    emit(out, &records)
}

fn cmd_vol_df(table: &Arc<MountTable>, args: &[String], out: &mut impl Write) -> CmdResult {
    let [uuid, devid] = fixed_args(args, "vol_df <uuid> <device-id>")?;
    let devid = parse_u64(devid, "device id")?;
    let handle = table.acquire(uuid)?;
    let report = space::volume_df(&KernelTrees::new(&handle), devid)?;
    emit(out, &report)
}

fn cmd_sub_list(table: &Arc<MountTable>, args: &[String], out: &mut impl Write) -> CmdResult {
    let [uuid] = fixed_args(args, "sub_list <uuid>")?;
    let handle = table.acquire(uuid)?;
    let records = subvol::list_subvolumes(&KernelTrees::new(&handle))?;
    emit(out, &records)
}

fn cmd_sub_make(table: &Arc<MountTable>, args: &[String]) -> CmdResult {
    let [uuid, path] = fixed_args(args, "sub_make <uuid> <path>")?;
    let mut handle = table.acquire(uuid)?;
    subvol::create(&mut handle, path)
}

fn cmd_sub_del(table: &Arc<MountTable>, args: &[String]) -> CmdResult {
    let [uuid, path] = fixed_args(args, "sub_del <uuid> <path>")?;
    let mut handle = table.acquire(uuid)?;
    subvol::delete(&mut handle, path)
}

fn cmd_sub_snap(table: &Arc<MountTable>, args: &[String]) -> CmdResult {
    let [uuid, source, dest] = fixed_args(args, "sub_snap <uuid> <source> <dest>")?;
    let mut handle = table.acquire(uuid)?;
    subvol::snapshot(&mut handle, source, dest)
}

fn cmd_sub_def(table: &Arc<MountTable>, args: &[String]) -> CmdResult {
    let [uuid, id] = fixed_args(args, "sub_def <uuid> <subvolume-id>")?;
    let id = parse_u64(id, "subvolume id")?;
    let handle = table.acquire(uuid)?;
    subvol::set_default(&handle, id)
}

fn cmd_ls(table: &Arc<MountTable>, args: &[String], out: &mut impl Write) -> CmdResult {
    // ls [-<filter>] <uuid> <path>
    let (filter, rest) = match args.first().map(String::as_str) {
        Some(flag) if flag.starts_with('-') => {
            let filter =
                TypeFilter::parse(&flag[1..]).ok_or_else(|| HelperError::InvalidRequest {
                    reason: format!("unknown type filter {flag:?}"),
                })?;
            (filter, &args[1..])
        }
        _ => (TypeFilter::All, args),
    };
    let [uuid, path] = fixed_args(rest, "ls [-all|-dir|-block] <uuid> <path>")?;

    let handle = table.acquire(uuid)?;
    for entry in vfs::ls(&handle, path, filter)? {
        emit(out, &entry)?;
    }
    Ok(())
}

fn cmd_dev_add(table: &Arc<MountTable>, args: &[String]) -> CmdResult {
    let [uuid, devname] = fixed_args(args, "dev_add <uuid> <device>")?;
    let handle = table.acquire(uuid)?;
    devices::add_device(&handle, devname)
}

/// Device removal migrates data and can run for hours; answer immediately
/// and do the work on a worker thread with its own handle.
fn cmd_dev_del(table: &Arc<MountTable>, args: &[String]) -> CmdResult {
    let [uuid, devname] = fixed_args(args, "dev_del <uuid> <device>")?;
    let table = Arc::clone(table);
    let uuid = uuid.to_owned();
    let devname = devname.to_owned();

    std::thread::Builder::new()
        .name("dev-remove".into())
        .spawn(move || {
            let result = table
                .acquire(&uuid)
                .and_then(|handle| devices::remove_device(&handle, &devname));
            match result {
                Ok(()) => tracing::info!(%uuid, %devname, "device removed"),
                Err(err) => tracing::error!(%uuid, %devname, %err, "device removal failed"),
            }
        })
        .map_err(HelperError::Io)?;
    Ok(())
}
