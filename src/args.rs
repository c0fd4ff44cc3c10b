//! Command-line definitions for the `par3` binary.

use clap::{Arg, ArgAction, Command};

pub fn command() -> Command {
    let common = |cmd: Command| {
        cmd.arg(
            Arg::new("par-file")
                .help("PAR3 index file (<base>.par3)")
                .required(true),
        )
        .arg(
            Arg::new("base-path")
                .short('B')
                .long("base-path")
                .help("Base directory for input file paths"),
        )
        .arg(
            Arg::new("memory")
                .short('m')
                .long("memory")
                .help("Memory limit, with optional k/m/g suffix"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Only print the final verdict"),
        )
    };

    Command::new("par3")
        .version(env!("CARGO_PKG_VERSION"))
        .about("PAR3 recovery-set creation, verification, and repair")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            common(Command::new("create").visible_alias("c"))
                .about("Create recovery files for a set of inputs")
                .arg(Arg::new("inputs").num_args(1..).required(true).help(
                    "Files and directories to protect",
                ))
                .arg(
                    Arg::new("block-count")
                        .short('b')
                        .long("block-count")
                        .help("Number of input blocks"),
                )
                .arg(
                    Arg::new("block-size")
                        .short('s')
                        .long("block-size")
                        .help("Size of each input block"),
                )
                .arg(
                    Arg::new("redundancy")
                        .short('r')
                        .long("redundancy")
                        .help("Recovery data amount in percent"),
                )
                .arg(
                    Arg::new("recovery-count")
                        .short('c')
                        .long("recovery-count")
                        .help("Number of recovery blocks"),
                )
                .arg(
                    Arg::new("first-recovery")
                        .long("first-recovery")
                        .help("Index of the first recovery block"),
                )
                .arg(
                    Arg::new("max-recovery")
                        .long("max-recovery")
                        .help("Ceiling on recovery blocks for this set"),
                )
                .arg(
                    Arg::new("uniform")
                        .short('u')
                        .long("uniform")
                        .action(ArgAction::SetTrue)
                        .help("Distribute recovery blocks uniformly over the volumes"),
                )
                .arg(
                    Arg::new("limit-size")
                        .short('l')
                        .long("limit-size")
                        .help("Cap each volume at this many bytes"),
                )
                .arg(
                    Arg::new("volumes")
                        .short('n')
                        .long("volumes")
                        .help("Number of recovery volumes"),
                )
                .arg(
                    Arg::new("recurse")
                        .short('R')
                        .long("recurse")
                        .action(ArgAction::SetTrue)
                        .help("Recurse into input directories"),
                )
                .arg(
                    Arg::new("data-packets")
                        .short('D')
                        .long("data-packets")
                        .action(ArgAction::SetTrue)
                        .help("Also store input blocks in data volumes"),
                )
                .arg(
                    Arg::new("unix-permissions")
                        .long("fu")
                        .action(ArgAction::SetTrue)
                        .help("Store UNIX Permissions Packets for the inputs"),
                )
                .arg(
                    Arg::new("fat-permissions")
                        .long("ff")
                        .action(ArgAction::SetTrue)
                        .help("Store FAT Permissions Packets for the inputs"),
                )
                .arg(
                    Arg::new("dedup")
                        .short('d')
                        .long("dedup")
                        .value_parser(["0", "1", "2"])
                        .default_value("0")
                        .help("Deduplication level"),
                )
                .arg(
                    Arg::new("ecc")
                        .short('e')
                        .long("ecc")
                        .value_parser(["1", "8"])
                        .default_value("1")
                        .help("Error correction code: 1 = Cauchy, 8 = FFT"),
                )
                .arg(
                    Arg::new("interleave")
                        .short('i')
                        .long("interleave")
                        .help("Number of extra cohorts for the FFT code"),
                )
                .arg(
                    Arg::new("repetition-limit")
                        .long("repetition-limit")
                        .help("Cap on metadata repetitions per volume"),
                )
                .arg(
                    Arg::new("absolute")
                        .long("absolute")
                        .action(ArgAction::SetTrue)
                        .help("Store absolute paths"),
                )
                .arg(
                    Arg::new("comment")
                        .short('C')
                        .long("comment")
                        .help("Attach a comment to the set"),
                )
                .arg(
                    Arg::new("trial")
                        .short('t')
                        .long("trial")
                        .action(ArgAction::SetTrue)
                        .help("Compute sizes only, write nothing"),
                ),
        )
        .subcommand(
            common(Command::new("verify").visible_alias("v"))
                .about("Verify the protected set")
                .arg(
                    Arg::new("search-limit")
                        .short('S')
                        .long("search-limit")
                        .help("Slide-scan budget in milliseconds"),
                ),
        )
        .subcommand(
            common(Command::new("repair").visible_alias("r"))
                .about("Verify and repair the protected set")
                .arg(
                    Arg::new("search-limit")
                        .short('S')
                        .long("search-limit")
                        .help("Slide-scan budget in milliseconds"),
                ),
        )
        .subcommand(
            common(Command::new("list").visible_alias("l"))
                .about("List the contents of a PAR3 set"),
        )
}

/// Parse a size argument with an optional k/m/g suffix.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let (digits, factor) = match text.chars().last()? {
        'k' | 'K' => (&text[..text.len() - 1], 1u64 << 10),
        'm' | 'M' => (&text[..text.len() - 1], 1u64 << 20),
        'g' | 'G' => (&text[..text.len() - 1], 1u64 << 30),
        _ => (text, 1),
    };
    digits.parse::<u64>().ok().map(|n| n * factor)
}
