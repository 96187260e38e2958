//! PSG packer command-line front-end.

mod args;

use args::{CliArgs, ParseOutcome};
use psgpack::pack::pack;
use std::env;
use std::fs;
use std::process::ExitCode;
use std::time::Instant;

fn main() -> ExitCode {
    let args = match CliArgs::parse(env::args().skip(1)) {
        ParseOutcome::Run(args) => args,
        ParseOutcome::Help => {
            CliArgs::print_help();
            return ExitCode::SUCCESS;
        }
        ParseOutcome::Error(message) => {
            eprintln!("{}", message);
            CliArgs::print_help();
            return ExitCode::from(2);
        }
    };

    println!("PSG track packer v{}", env!("CARGO_PKG_VERSION"));

    let source = match fs::read(&args.input) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("Can't read input file {}: {}", args.input, err);
            return ExitCode::FAILURE;
        }
    };

    println!("Starting compression...");
    let started = Instant::now();
    let packed = match pack(&source, &args.options) {
        Ok(packed) => packed,
        Err(err) => {
            eprintln!("Compression failed: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let elapsed = started.elapsed();

    if let Err(err) = fs::write(&args.output, &packed.data) {
        eprintln!("Can't write output file {}: {}", args.output, err);
        return ExitCode::FAILURE;
    }

    if let Some(dump) = &packed.dump {
        let dump_path = format!("{}.psg", args.output);
        if let Err(err) = fs::write(&dump_path, dump) {
            eprintln!("Can't write dump file {}: {}", dump_path, err);
            return ExitCode::FAILURE;
        }
        println!("Dumped post-clean frames to {}", dump_path);
    }

    if args.info {
        println!("offset,kind,frames,bytes,tstates");
        for element in &packed.report {
            println!(
                "{},{},{},{},{}",
                element.offset,
                element.kind.as_str(),
                element.frames,
                element.bytes,
                element.tstates
            );
        }
    }

    let stats = &packed.stats;
    println!(
        "Compression done in {:.3} second(s)",
        elapsed.as_secs_f64()
    );
    println!("Input size:\t{}", stats.input_bytes);
    println!("Packed size:\t{}", stats.output_bytes);
    println!("PSG frames:\t{}", stats.source_frames);
    println!("Stream frames:\t{}", stats.stream_frames);
    println!("Own frames:\t{} ({} bytes)", stats.own_frames, stats.own_bytes);
    println!("2-byte refs:\t{}", stats.short_refs);
    println!("Total refs:\t{}", stats.short_refs + stats.long_refs);
    println!("Ref frames:\t{}", stats.ref_frames);
    println!(
        "Delay frames:\t{} in {} record(s)",
        stats.delay_frames, stats.delay_records
    );
    if stats.pack_passes > 1 {
        println!("Pack passes:\t{}", stats.pack_passes);
    }
    let sizes: Vec<String> = stats
        .delta_sizes
        .iter()
        .map(|(size, count)| format!("{}:{}", size, count))
        .collect();
    if !sizes.is_empty() {
        println!("Frame regs:\t{}", sizes.join(" "));
    }
    if stats.clean.unused_tone_a
        + stats.clean.unused_tone_b
        + stats.clean.unused_tone_c
        + stats.clean.unused_envelope
        + stats.clean.unused_env_shape
        + stats.clean.unused_noise
        > 0
    {
        println!(
            "Cleaned:\ttone {}/{}/{}, envelope {}, shape {}, noise {}",
            stats.clean.unused_tone_a,
            stats.clean.unused_tone_b,
            stats.clean.unused_tone_c,
            stats.clean.unused_envelope,
            stats.clean.unused_env_shape,
            stats.clean.unused_noise
        );
    }

    ExitCode::SUCCESS
}
