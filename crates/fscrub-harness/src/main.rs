#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use asupersync::Cx;
use fscrub_core::{RetryPolicy, ScrubOptions, ScrubType};
use fscrub_harness::{Image, ImageSpec, ScrubReport, open_image, scrub_all, scrub_one};
use std::env;
use std::fs;
use std::path::Path;

fn cli_cx() -> Cx {
    Cx::for_request()
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("mkfs") => mkfs(&args[1..]),
        Some("scrub") => scrub(&args[1..]),
        Some("spec") => {
            let spec = if args.get(1).map(String::as_str) == Some("--all-features") {
                ImageSpec::all_features()
            } else {
                ImageSpec::default()
            };
            println!("{}", serde_json::to_string_pretty(&spec)?);
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn mkfs(args: &[String]) -> Result<()> {
    let Some(image_path) = args.first() else {
        bail!("usage: fscrub-harness mkfs <image> [spec.json]");
    };
    let spec = match args.get(1) {
        Some(spec_path) => {
            let text = fs::read_to_string(spec_path)
                .with_context(|| format!("failed to read {spec_path}"))?;
            serde_json::from_str::<ImageSpec>(&text)
                .with_context(|| format!("invalid image spec in {spec_path}"))?
        }
        None => ImageSpec::default(),
    };
    let cx = cli_cx();
    let image = Image::build(&cx, &spec)?;
    image.save(&cx, Path::new(image_path))?;
    println!(
        "wrote {image_path}: {} AGs of {} blocks, block size {}, features [{}]",
        spec.agcount,
        spec.agblocks,
        spec.block_size,
        image.superblock().features_ro_compat
    );
    Ok(())
}

fn scrub(args: &[String]) -> Result<()> {
    let mut positional = Vec::new();
    let mut options = ScrubOptions::default();
    for arg in args {
        match arg.as_str() {
            "--conservative" => options.start_conservative = true,
            "--no-retry" => options.retry = RetryPolicy::Never,
            flag if flag.starts_with("--") => bail!("unknown scrub option: {flag}"),
            _ => positional.push(arg.as_str()),
        }
    }
    let Some(image_path) = positional.first() else {
        bail!("usage: fscrub-harness scrub <image> [type [agno]] [--conservative] [--no-retry]");
    };
    let cx = cli_cx();
    let mount = open_image(&cx, Path::new(image_path))?;

    let report = match positional.get(1) {
        None => scrub_all(&cx, &mount, &options),
        Some(name) => {
            let scrub_type: ScrubType = name.parse()?;
            let agno = positional
                .get(2)
                .map(|raw| raw.parse::<u32>())
                .transpose()
                .context("agno must be a number")?
                .unwrap_or(0);
            let mut report = ScrubReport::default();
            let entry = scrub_one(&cx, &mount, scrub_type, agno, &options);
            report.record(entry);
            report
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.has_problems() {
        bail!(
            "{} scrubs found corruption, {} failed",
            report.corrupt,
            report.errors
        );
    }
    Ok(())
}

fn print_usage() {
    println!("fscrub-harness: build synthetic images and scrub them");
    println!();
    println!("USAGE:");
    println!("  fscrub-harness mkfs <image> [spec.json]");
    println!("  fscrub-harness scrub <image> [type [agno]] [--conservative] [--no-retry]");
    println!("  fscrub-harness spec [--all-features]");
    println!();
    println!("TYPES:");
    let names: Vec<&str> = ScrubType::ALL.iter().map(|t| t.name()).collect();
    println!("  {}", names.join(" "));
}
