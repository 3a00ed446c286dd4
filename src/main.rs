use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use facetrail::config::Config;
use facetrail::db::IdentityId;
use facetrail::faces::OnnxFaceEmbedder;
use facetrail::ingest::{IngestEvent, Ingestor};
use facetrail::logging::{self, LogTarget};

#[derive(Debug, PartialEq)]
enum Command {
    Scan(PathBuf),
    Faces(PathBuf),
    Images(IdentityId),
    Together(Vec<IdentityId>),
    Like(PathBuf),
    Merge(IdentityId, Vec<IdentityId>),
    Status,
}

#[derive(Debug, PartialEq)]
struct Cli {
    config_path: Option<PathBuf>,
    verbose: bool,
    json: bool,
    command: Command,
}

#[derive(Debug, PartialEq)]
enum Parsed {
    Help,
    Version,
    Run(Cli),
}

fn parse_args(args: &[String]) -> Result<Parsed, String> {
    let mut config_path = None;
    let mut verbose = false;
    let mut json = false;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return Ok(Parsed::Help),
            "--version" | "-V" => return Ok(Parsed::Version),
            "--verbose" | "-v" => verbose = true,
            "--json" => json = true,
            "--config" | "-c" => {
                let path = args.get(i + 1).ok_or("--config requires a path argument")?;
                config_path = Some(PathBuf::from(path));
                i += 1;
            }
            arg if arg.starts_with('-') && arg.parse::<i64>().is_err() => {
                return Err(format!("Unknown argument: {}", arg));
            }
            arg => positional.push(arg),
        }
        i += 1;
    }

    let (name, rest) = positional.split_first().ok_or("No command given")?;
    let command = match *name {
        "scan" => Command::Scan(single_path(name, rest)?),
        "faces" => Command::Faces(single_path(name, rest)?),
        "like" => Command::Like(single_path(name, rest)?),
        "images" => match identity_ids(rest)?.as_slice() {
            [id] => Command::Images(*id),
            _ => return Err("images takes exactly one identity".to_string()),
        },
        "together" => {
            let ids = identity_ids(rest)?;
            if ids.is_empty() {
                return Err("together needs at least one identity".to_string());
            }
            Command::Together(ids)
        }
        "merge" => {
            let ids = identity_ids(rest)?;
            match ids.split_first() {
                Some((primary, others)) if !others.is_empty() => {
                    Command::Merge(*primary, others.to_vec())
                }
                _ => return Err("merge needs a primary identity and at least one other".to_string()),
            }
        }
        "status" if rest.is_empty() => Command::Status,
        "status" => return Err("status takes no arguments".to_string()),
        other => return Err(format!("Unknown command: {}", other)),
    };

    Ok(Parsed::Run(Cli {
        config_path,
        verbose,
        json,
        command,
    }))
}

fn single_path(command: &str, rest: &[&str]) -> Result<PathBuf, String> {
    match rest {
        [path] => Ok(PathBuf::from(path)),
        _ => Err(format!("{} takes exactly one path", command)),
    }
}

fn identity_ids(rest: &[&str]) -> Result<Vec<IdentityId>, String> {
    rest.iter()
        .map(|s| s.parse().map_err(|_| format!("Not an identity id: {}", s)))
        .collect()
}

fn print_help() {
    println!(
        r#"facetrail - find the same faces across a photo folder

USAGE:
    facetrail [OPTIONS] <COMMAND>

COMMANDS:
    scan <folder>                 Index new images under a folder
    faces <image>                 Identities found in an image
    images <identity>             Images containing an identity
    together <identity>...        Images containing all of the identities
    like <image>                  Images containing every identity of an image
    merge <primary> <other>...    Fold identities into the primary one
    status                        Store and index counts

OPTIONS:
    --config, -c PATH   Path to config file
    --verbose, -v       Log to stderr
    --json              Print results as JSON
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FACETRAIL_CONFIG    Path to config file (overrides default location)
    FACETRAIL_LOG       Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/facetrail/config.toml"#
    );
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(Parsed::Run(cli)) => cli,
        Ok(Parsed::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Parsed::Version) => {
            println!("facetrail {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Err(message) => {
            eprintln!("Error: {}", message);
            print_help();
            std::process::exit(1);
        }
    };

    let target = if cli.verbose { LogTarget::Stderr } else { LogTarget::Background };
    if let Err(e) = logging::init(target, Some(Config::config_dir().join("logs"))) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let embedder = Arc::new(OnnxFaceEmbedder::new(config.detector.clone()));
    let ingestor = Ingestor::open(&config, embedder.clone())?;

    match cli.command {
        Command::Scan(folder) => {
            // Fail once up front instead of once per image
            embedder.warm_up().context("Failed to load face models")?;
            scan(ingestor, &folder, cli.json)
        }
        Command::Faces(image) => {
            let image = resolve_path(&image);
            let occurrences = ingestor.store().occurrences_in(&image)?;
            if cli.json {
                return print_json(&occurrences);
            }
            if occurrences.is_empty() {
                println!("No faces recorded for {}", image.display());
            }
            for o in occurrences {
                println!(
                    "identity {:>6}  ({}, {}) - ({}, {})",
                    o.identity_id, o.bbox.x1, o.bbox.y1, o.bbox.x2, o.bbox.y2
                );
            }
            Ok(())
        }
        Command::Images(identity) => {
            let paths = ingestor.request_images_with(identity)?;
            print_paths(&paths, cli.json)
        }
        Command::Together(identities) => {
            let paths = ingestor.request_images_with_all(&identities)?;
            print_paths(&paths, cli.json)
        }
        Command::Like(image) => {
            let paths = ingestor.request_images_with_all_in(&resolve_path(&image))?;
            print_paths(&paths, cli.json)
        }
        Command::Merge(primary, others) => {
            let redirected = ingestor.merge(primary, &others)?;
            if cli.json {
                return print_json(&serde_json::json!({
                    "primary": primary,
                    "merged": &others,
                    "redirected": redirected,
                }));
            }
            println!("Merged {:?} into {} ({} occurrences)", others, primary, redirected);
            Ok(())
        }
        Command::Status => {
            let stats = ingestor.store().stats()?;
            let index = ingestor.index();
            if cli.json {
                return print_json(&serde_json::json!({
                    "store": stats,
                    "index_rows": index.len(),
                    "index_dimension": index.dimension(),
                    "match_threshold": index.threshold(),
                    "db_path": &config.db_path,
                    "index_path": index.path(),
                }));
            }
            println!("Database:    {}", config.db_path.display());
            println!("Index:       {}", index.path().display());
            println!("Images:      {}", stats.images);
            println!("Identities:  {}", stats.identities);
            println!("Faces:       {}", stats.occurrences);
            println!("Index rows:  {} x {}", index.len(), index.dimension());
            println!("Threshold:   {}", index.threshold());
            Ok(())
        }
    }
}

/// Run the pipeline over `folder` until every new image has been handled.
fn scan(ingestor: Ingestor, folder: &Path, json: bool) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut ingestor = ingestor.with_events(tx);

    let all = ingestor
        .scan(folder)
        .with_context(|| format!("Failed to scan {}", folder.display()))?;
    let new = ingestor.pending() + ingestor.in_flight();
    if !json {
        println!("Found {} images, {} new", all.len(), new);
    }

    loop {
        for event in rx.try_iter() {
            if !json {
                print_event(&event);
            }
        }
        if !ingestor.wait_next() {
            break;
        }
    }
    for event in rx.try_iter() {
        if !json {
            print_event(&event);
        }
    }

    let stats = ingestor.stats();
    if json {
        return print_json(&stats);
    }
    println!(
        "Done: {} indexed, {} failed, {} faces, {} new identities",
        stats.indexed, stats.failed, stats.faces, stats.new_identities
    );
    if stats.persist_failures > 0 {
        println!("Warning: {} writes failed, see the log", stats.persist_failures);
    }
    Ok(())
}

fn print_event(event: &IngestEvent) {
    match event {
        IngestEvent::ImageIndexed { path, identities } => {
            println!("  {}  {:?}", path.display(), identities);
        }
        IngestEvent::ImageFailed { path, error } => {
            println!("  {}  failed: {}", path.display(), error);
        }
        IngestEvent::PersistFailed { error } => {
            println!("  write failed: {}", error);
        }
        _ => {}
    }
}

fn print_paths(paths: &std::collections::BTreeSet<PathBuf>, json: bool) -> Result<()> {
    if json {
        return print_json(paths);
    }
    for path in paths {
        println!("{}", path.display());
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Stored paths are absolute; match a relative argument against them.
fn resolve_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Parsed, String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        parse_args(&args)
    }

    fn command(args: &[&str]) -> Command {
        match parse(args).unwrap() {
            Parsed::Run(cli) => cli.command,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(command(&["scan", "/photos"]), Command::Scan(PathBuf::from("/photos")));
        assert_eq!(command(&["images", "4"]), Command::Images(4));
        assert_eq!(command(&["together", "1", "2"]), Command::Together(vec![1, 2]));
        assert_eq!(command(&["merge", "1", "2", "3"]), Command::Merge(1, vec![2, 3]));
        assert_eq!(command(&["status"]), Command::Status);
    }

    #[test]
    fn test_parse_flags() {
        let Parsed::Run(cli) = parse(&["--json", "-c", "/tmp/c.toml", "faces", "a.jpg", "-v"]).unwrap() else {
            panic!("expected a command");
        };
        assert!(cli.json);
        assert!(cli.verbose);
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/c.toml")));
        assert_eq!(cli.command, Command::Faces(PathBuf::from("a.jpg")));

        assert_eq!(parse(&["--help", "scan"]).unwrap(), Parsed::Help);
        assert_eq!(parse(&["-V"]).unwrap(), Parsed::Version);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["scan"]).is_err());
        assert!(parse(&["merge", "1"]).is_err());
        assert!(parse(&["images", "abc"]).is_err());
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--bogus", "status"]).is_err());
        assert!(parse(&["explode"]).is_err());
    }
}
