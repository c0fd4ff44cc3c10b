use anyhow::Context;
use par3rs::args::{command, parse_size};
use par3rs::codec::EccMethod;
use par3rs::creator::{create, CreatorOptions, RecoveryFileScheme};
use par3rs::error::Error;
use par3rs::file_ops::{collect_par_files, load_packet_set};
use par3rs::map::InputEntry;
use par3rs::repair::{repair, RepairOptions, RepairOutcome};
use par3rs::verify::{verify, VerifyOptions, VerifyVerdict};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("par3: {err:#}");
            let code = err
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

fn run() -> anyhow::Result<ExitCode> {
    let matches = command().get_matches();
    let (name, sub) = matches.subcommand().expect("subcommand is required");

    let par_file = PathBuf::from(sub.get_one::<String>("par-file").unwrap());
    let base = sub
        .get_one::<String>("base-path")
        .map(PathBuf::from)
        .or_else(|| par_file.parent().map(Path::to_path_buf))
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    let memory_limit = sub
        .get_one::<String>("memory")
        .and_then(|s| parse_size(s))
        .unwrap_or(0);
    let quiet = sub.get_flag("quiet");

    match name {
        "create" => run_create(&par_file, &base, memory_limit, quiet, sub),
        "verify" => run_verify(&par_file, &base, quiet, sub),
        "repair" => run_repair(&par_file, &base, memory_limit, quiet, sub),
        "list" => run_list(&par_file),
        other => Err(Error::InvalidCommand(other.to_string()).into()),
    }
}

fn run_create(
    par_file: &Path,
    base: &Path,
    memory_limit: u64,
    quiet: bool,
    sub: &clap::ArgMatches,
) -> anyhow::Result<ExitCode> {
    let parse_u64 = |key: &str| -> anyhow::Result<Option<u64>> {
        match sub.get_one::<String>(key) {
            Some(text) => Ok(Some(parse_size(text).ok_or_else(|| {
                Error::InvalidCommand(format!("bad value for --{key}: {text}"))
            })?)),
            None => Ok(None),
        }
    };

    let scheme = if sub.get_flag("uniform") {
        let files = parse_u64("volumes")?
            .ok_or_else(|| Error::InvalidCommand("--uniform needs --volumes".into()))?;
        RecoveryFileScheme::Uniform(files as u32)
    } else if let Some(limit) = parse_u64("limit-size")? {
        RecoveryFileScheme::LimitSize(limit)
    } else if let Some(files) = parse_u64("volumes")? {
        RecoveryFileScheme::Variable(files as u32)
    } else {
        RecoveryFileScheme::PowerOfTwo
    };

    let ecc = match sub.get_one::<String>("ecc").map(String::as_str) {
        Some("8") => EccMethod::Fft,
        _ => EccMethod::Cauchy,
    };

    let options = CreatorOptions {
        block_size: parse_u64("block-size")?,
        block_count: parse_u64("block-count")?,
        redundancy_percent: parse_u64("redundancy")?.unwrap_or(0),
        recovery_count: parse_u64("recovery-count")?,
        first_recovery: parse_u64("first-recovery")?.unwrap_or(0),
        max_recovery: parse_u64("max-recovery")?.unwrap_or(0),
        scheme,
        store_data_packets: sub.get_flag("data-packets"),
        unix_permissions: sub.get_flag("unix-permissions"),
        fat_permissions: sub.get_flag("fat-permissions"),
        dedup: sub
            .get_one::<String>("dedup")
            .map(|d| d.parse().unwrap_or(0))
            .unwrap_or(0),
        ecc,
        interleave: parse_u64("interleave")?.unwrap_or(0) as u32,
        repetition_limit: parse_u64("repetition-limit")?.unwrap_or(0) as u32,
        memory_limit,
        absolute_path: sub
            .get_flag("absolute")
            .then(|| base.to_string_lossy().into_owned()),
        comment: sub.get_one::<String>("comment").cloned(),
        trial: sub.get_flag("trial"),
    };

    let recurse = sub.get_flag("recurse");
    let mut inputs = Vec::new();
    let mut dirs = Vec::new();
    for operand in sub.get_many::<String>("inputs").unwrap() {
        collect_input(base, Path::new(operand), recurse, &mut inputs, &mut dirs)?;
    }
    if inputs.is_empty() {
        return Err(Error::InvalidCommand("no input files found".into()).into());
    }

    let report = create(base, inputs, dirs, par_file, &options)?;
    if !quiet {
        println!(
            "Set {}: {} blocks of {} bytes, {} recovery blocks.",
            report.set_id, report.block_count, report.block_size, report.recovery_count
        );
        for file in &report.files {
            if options.trial {
                println!("Size of {} = {}", file.path.display(), file.size);
            } else {
                println!("Wrote {} ({} bytes)", file.path.display(), file.size);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Resolve one command-line operand into input entries relative to base.
fn collect_input(
    base: &Path,
    operand: &Path,
    recurse: bool,
    inputs: &mut Vec<InputEntry>,
    dirs: &mut Vec<String>,
) -> anyhow::Result<()> {
    let path = if operand.is_absolute() {
        operand.to_path_buf()
    } else {
        base.join(operand)
    };
    let metadata = std::fs::metadata(&path)
        .with_context(|| format!("cannot stat input {}", path.display()))?;

    let relative = path
        .strip_prefix(base)
        .unwrap_or(operand)
        .to_string_lossy()
        .replace('\\', "/");
    let name = par3rs::paths::normalize_relative(&relative)?;

    if metadata.is_file() {
        inputs.push(InputEntry {
            name,
            path,
            size: metadata.len(),
        });
    } else if metadata.is_dir() {
        if !recurse {
            return Err(
                Error::InvalidCommand(format!("{} is a directory (use -R)", path.display()))
                    .into(),
            );
        }
        dirs.push(name);
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for entry in entries {
            collect_input(base, &entry, recurse, inputs, dirs)?;
        }
    }
    Ok(())
}

/// Files in the base directory that are neither inputs nor PAR3 files;
/// candidates for misnamed-file matching and block salvage.
fn find_extra_files(base: &Path, input_names: &[String], par_files: &[PathBuf]) -> Vec<PathBuf> {
    let mut extras = Vec::new();
    let Ok(entries) = std::fs::read_dir(base) else {
        return extras;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().is_some_and(|e| e == "par3") || par_files.contains(&path) {
            continue;
        }
        let relative = path
            .strip_prefix(base)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        if input_names.iter().any(|n| *n == relative) {
            continue;
        }
        if relative.starts_with("par3_") && relative.ends_with(".tmp") {
            continue;
        }
        extras.push(path);
    }
    extras.sort();
    extras
}

fn run_verify(
    par_file: &Path,
    base: &Path,
    quiet: bool,
    sub: &clap::ArgMatches,
) -> anyhow::Result<ExitCode> {
    let par_files = collect_par_files(par_file);
    let set = load_packet_set(&par_files)?;
    let input_names: Vec<String> = set.files.iter().map(|(_, f)| f.name.clone()).collect();
    let extras = find_extra_files(base, &input_names, &par_files);

    let options = VerifyOptions {
        search_limit_ms: sub
            .get_one::<String>("search-limit")
            .and_then(|s| s.parse().ok()),
        quiet,
    };
    let report = verify(&set, base, &extras, &options)?;

    Ok(match report.verdict {
        VerifyVerdict::AllCorrect => ExitCode::SUCCESS,
        VerifyVerdict::RepairPossible => ExitCode::from(5),
        VerifyVerdict::RepairNotPossible => ExitCode::from(6),
    })
}

fn run_repair(
    par_file: &Path,
    base: &Path,
    memory_limit: u64,
    quiet: bool,
    sub: &clap::ArgMatches,
) -> anyhow::Result<ExitCode> {
    let par_files = collect_par_files(par_file);
    let set = load_packet_set(&par_files)?;
    let input_names: Vec<String> = set.files.iter().map(|(_, f)| f.name.clone()).collect();
    let extras = find_extra_files(base, &input_names, &par_files);

    let verify_options = VerifyOptions {
        search_limit_ms: sub
            .get_one::<String>("search-limit")
            .and_then(|s| s.parse().ok()),
        quiet,
    };
    let mut report = verify(&set, base, &extras, &verify_options)?;

    let repair_options = RepairOptions {
        memory_limit,
        quiet,
    };
    let outcome = repair(&set, base, &mut report, &repair_options)?;

    if !quiet {
        match outcome.outcome {
            RepairOutcome::NotRequired => {}
            RepairOutcome::NotPossible => println!("Repair is not possible."),
            RepairOutcome::Success => println!(
                "Repaired {} file(s).",
                outcome.repaired_files
            ),
            RepairOutcome::Failed => println!(
                "Repaired {} file(s), {} failed.",
                outcome.repaired_files, outcome.failed_files
            ),
        }
    }

    Ok(match outcome.outcome {
        RepairOutcome::NotRequired | RepairOutcome::Success => ExitCode::SUCCESS,
        RepairOutcome::NotPossible => ExitCode::from(6),
        RepairOutcome::Failed => ExitCode::from(7),
    })
}

fn run_list(par_file: &Path) -> anyhow::Result<ExitCode> {
    let par_files = collect_par_files(par_file);
    let set = load_packet_set(&par_files)?;

    println!("Set ID: {}", set.set_id);
    println!("Block size: {}", set.start.block_size);
    println!("Block count: {}", set.root.lowest_unused_block);
    if let Some(creator) = &set.creator {
        println!("Creator: {creator}");
    }
    if let Some(comment) = &set.comment {
        println!("Comment: {comment}");
    }
    println!("Recovery blocks: {}", set.usable_recovery().count());
    println!("Files:");
    for (_, file) in &set.files {
        println!("  {} ({} bytes)", file.name, file.file_size());
    }
    for (_, dir) in &set.dirs {
        println!("  {}/", dir.name);
    }
    Ok(ExitCode::SUCCESS)
}
