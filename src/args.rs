//! Command-line argument parsing for the PSG packer CLI.
//!
//! This module handles parsing and validation of CLI arguments including:
//! - Input and output file paths
//! - Compression level selection
//! - Cleaning, dump, timing-report and cut-range options
//! - Help text generation

use psgpack::pack::PackOptions;
use psgpack::CleanFlags;

/// Parsed command-line arguments.
#[derive(Debug)]
pub struct CliArgs {
    /// PSG source file to compress
    pub input: String,
    /// Packed track to write
    pub output: String,
    /// Assembled pack configuration
    pub options: PackOptions,
    /// Print the per-element timing CSV after packing
    pub info: bool,
}

/// Outcome of argument parsing.
#[derive(Debug)]
pub enum ParseOutcome {
    /// Arguments are complete; run the packer.
    Run(CliArgs),
    /// Help was requested.
    Help,
    /// Something was wrong; the message was already printed.
    Error(String),
}

impl CliArgs {
    /// Parse arguments from an iterator (program name already skipped).
    pub fn parse(args: impl Iterator<Item = String>) -> ParseOutcome {
        let mut level: u8 = 1;
        let mut clean = true;
        let mut dump = false;
        let mut info = false;
        let mut add_scf = false;
        let mut cut: Vec<(u32, u32)> = Vec::new();
        let mut positional: Vec<String> = Vec::new();

        let mut iter = args;
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" | "-h" => return ParseOutcome::Help,
                "--clean" | "-c" => clean = true,
                "--keep" | "-k" => clean = false,
                "--dump" | "-d" => dump = true,
                "--info" | "-i" => info = true,
                "--scf" => add_scf = true,
                "--level" | "-l" => match iter.next() {
                    Some(value) => match parse_level(&value) {
                        Some(v) => level = v,
                        None => {
                            return ParseOutcome::Error(format!(
                                "invalid compression level: {}",
                                value
                            ))
                        }
                    },
                    None => {
                        return ParseOutcome::Error("--level requires an argument (0-5)".into())
                    }
                },
                _ if arg.starts_with("--level=") => match parse_level(&arg[8..]) {
                    Some(v) => level = v,
                    None => {
                        return ParseOutcome::Error(format!(
                            "invalid compression level: {}",
                            &arg[8..]
                        ))
                    }
                },
                "--cut" => match iter.next() {
                    Some(value) => match parse_cut(&value) {
                        Some(range) => cut.push(range),
                        None => {
                            return ParseOutcome::Error(format!("invalid cut range: {}", value))
                        }
                    },
                    None => {
                        return ParseOutcome::Error("--cut requires an argument (from,to)".into())
                    }
                },
                _ if arg.starts_with("--cut=") => match parse_cut(&arg[6..]) {
                    Some(range) => cut.push(range),
                    None => {
                        return ParseOutcome::Error(format!("invalid cut range: {}", &arg[6..]))
                    }
                },
                _ if arg.starts_with('-') && arg.len() > 1 => {
                    return ParseOutcome::Error(format!("unknown option: {}", arg));
                }
                _ => positional.push(arg),
            }
        }

        if positional.len() != 2 {
            return ParseOutcome::Error(format!(
                "expected input_file and output_file, got {} positional argument(s)",
                positional.len()
            ));
        }

        let output = positional.pop().expect("two positionals");
        let input = positional.pop().expect("two positionals");

        ParseOutcome::Run(CliArgs {
            input,
            output,
            options: PackOptions {
                level,
                clean: clean.then(CleanFlags::default),
                cut,
                dump,
                add_scf,
            },
            info,
        })
    }

    /// Print help text to stderr.
    pub fn print_help() {
        eprintln!(
            "Usage:\n  psgpack [OPTIONS] input_file output_file\n\n\
             Options:\n\
             \x20 -l, --level <0-5>    Compression level (default 1). Levels 0-1 favour\n\
             \x20                      player speed, 4-5 re-pack until the decode budget\n\
             \x20                      holds at maximum compression.\n\
             \x20 -c, --clean          Suppress inaudible register writes (default).\n\
             \x20 -k, --keep           Keep all register writes verbatim.\n\
             \x20 -d, --dump           Write the post-clean frame stream next to the\n\
             \x20                      output as <output>.psg.\n\
             \x20 -i, --info           Print a per-element timing CSV after packing.\n\
             \x20     --scf            Model the scf-adjusted player build.\n\
             \x20     --cut <from,to>  Admit only source frames in [from, to); repeatable.\n\
             \x20 -h, --help           Show this help\n\n\
             Example:\n\
             \x20 psgpack --level 4 track.psg track.mus\n"
        );
    }
}

fn parse_level(value: &str) -> Option<u8> {
    match value.parse::<u8>() {
        Ok(v) if v <= 5 => Some(v),
        _ => None,
    }
}

fn parse_cut(value: &str) -> Option<(u32, u32)> {
    let (from, to) = value.split_once(',')?;
    let from = from.trim().parse::<u32>().ok()?;
    let to = to.trim().parse::<u32>().ok()?;
    if from < to {
        Some((from, to))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ParseOutcome {
        CliArgs::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        match parse(&["in.psg", "out.mus"]) {
            ParseOutcome::Run(args) => {
                assert_eq!(args.input, "in.psg");
                assert_eq!(args.output, "out.mus");
                assert_eq!(args.options.level, 1);
                assert!(args.options.clean.is_some());
                assert!(!args.options.dump);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_level_and_keep() {
        match parse(&["--level", "4", "-k", "in.psg", "out.mus"]) {
            ParseOutcome::Run(args) => {
                assert_eq!(args.options.level, 4);
                assert!(args.options.clean.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_cut_ranges_accumulate() {
        match parse(&["--cut", "0,100", "--cut=250,300", "in.psg", "out.mus"]) {
            ParseOutcome::Run(args) => {
                assert_eq!(args.options.cut, vec![(0, 100), (250, 300)]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_level_rejected() {
        assert!(matches!(
            parse(&["--level", "6", "in.psg", "out.mus"]),
            ParseOutcome::Error(_)
        ));
        assert!(matches!(
            parse(&["--level", "fast", "in.psg", "out.mus"]),
            ParseOutcome::Error(_)
        ));
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(matches!(
            parse(&["--fast", "in.psg", "out.mus"]),
            ParseOutcome::Error(_)
        ));
    }

    #[test]
    fn test_missing_files_rejected() {
        assert!(matches!(parse(&["in.psg"]), ParseOutcome::Error(_)));
    }

    #[test]
    fn test_bad_cut_rejected() {
        assert!(matches!(
            parse(&["--cut", "5,5", "in.psg", "out.mus"]),
            ParseOutcome::Error(_)
        ));
    }
}
