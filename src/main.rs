use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use photosort::core::duplicate::{duplicate_stats, group_duplicates};
use photosort::core::hash::{DigestMap, HashOptions, HashService, PerceptualAlgorithm, Resolution};
use photosort::core::index::DigestIndex;
use photosort::core::layout::Layout;
use photosort::core::placement::{PlacementConfig, PlacementEngine};
use photosort::core::similarity::{Comparator, SimilarityPolicy};
use photosort::hashmap::{
    DUPLICATES_FILE_NAME, DUPLICATES_HELPER_FILE_NAME, HASHMAP_FILE_NAME, MERGED_FILE_NAME,
    MapBuilder, backup_file, prune_missing, read_and_merge, read_digest_map, write_json,
};
use photosort::scanner::{Scanner, Selection};
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(
    name = "photosort",
    version,
    about = "Hash, deduplicate and sort photos into a dated folder tree"
)]
struct Cli {
    /// Increase verbosity (-v=INFO, -vv=DEBUG, -vvv=TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build (or resume) the hash map of a directory
    Hash {
        /// Directory to hash
        #[arg(value_name = "DIR")]
        source: PathBuf,
        /// Output file (default: `<dir>/photosort_hashmap.json`)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// Drop entries of deleted files from an existing hash file
        #[arg(long)]
        update: bool,
        /// Hash every file, not only images
        #[arg(long)]
        all: bool,
        #[command(flatten)]
        hashing: HashingArgs,
    },

    /// Merge hash maps and write the reverse lookup helper
    Merge {
        /// Hash map files; later ones win on conflicts
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
        /// Directory for the merged files (default: next to the first file)
        #[arg(long, value_name = "DIR")]
        output_path: Option<PathBuf>,
    },

    /// Find duplicate groups in one or more hash maps
    Duplicates {
        /// Hash map files
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
        /// Report disk usage of kept and duplicated files
        #[arg(long)]
        info: bool,
    },

    /// Copy pictures into `<destination>/YYYY/YYMM/YYMMDD`, skipping ones already there
    Sort {
        #[arg(value_name = "SOURCE")]
        source: PathBuf,
        #[arg(value_name = "DESTINATION")]
        destination: PathBuf,
        /// Skip files whose name is taken by a different picture instead of renaming them
        #[arg(long)]
        no_rename: bool,
        /// Stop at the month folder
        #[arg(long)]
        monthly: bool,
        /// Hash map of pictures already sorted; updated with the new copies
        #[arg(long, value_name = "FILE")]
        hash_file: Option<PathBuf>,
        /// Compare exact digests only
        #[arg(long)]
        no_perceptual: bool,
        /// Compare siblings of any size, not only those within 10%
        #[arg(long)]
        no_size_check: bool,
        /// Sort every file, not only images
        #[arg(long)]
        all: bool,
        #[command(flatten)]
        hashing: HashingArgs,
        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Show how similar two files are
    Compare {
        first: PathBuf,
        second: PathBuf,
        #[command(flatten)]
        hashing: HashingArgs,
        #[command(flatten)]
        policy: PolicyArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct HashingArgs {
    /// Perceptual hash algorithms to compute
    #[arg(
        long = "algorithm",
        value_enum,
        value_delimiter = ',',
        default_values_t = [PerceptualAlgorithm::Average, PerceptualAlgorithm::Difference]
    )]
    algorithms: Vec<PerceptualAlgorithm>,
    /// Hash resolution factor, or `auto` to pick one from the pixel count
    #[arg(long, default_value_t = Resolution::default())]
    resolution: Resolution,
}

impl HashingArgs {
    fn options(&self) -> HashOptions {
        HashOptions {
            perceptual: self.algorithms.clone(),
            resolution: self.resolution,
        }
    }
}

#[derive(Args, Debug, Clone, Copy)]
struct PolicyArgs {
    /// Largest Hamming distance allowed for any single algorithm
    #[arg(long, default_value_t = SimilarityPolicy::default().max_distance)]
    max_distance: u32,
    /// Largest mean Hamming distance allowed over all algorithms
    #[arg(long, default_value_t = SimilarityPolicy::default().avg_distance)]
    avg_distance: f64,
}

impl PolicyArgs {
    fn policy(&self) -> SimilarityPolicy {
        SimilarityPolicy {
            max_distance: self.max_distance,
            avg_distance: self.avg_distance,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Hash {
            source,
            output,
            update,
            all,
            hashing,
        } => {
            let source = fs::canonicalize(&source)
                .with_context(|| format!("Source directory {} not found", source.display()))?;
            let output = output.unwrap_or_else(|| source.join(HASHMAP_FILE_NAME));

            if update && !output.is_file() {
                anyhow::bail!(
                    "--update needs an existing hash file, {} not found",
                    output.display()
                );
            }

            let mut existing = if output.is_file() {
                read_digest_map(&output)
                    .with_context(|| format!("Could not read hash file {}", output.display()))?
            } else {
                DigestMap::new()
            };

            if !existing.is_empty() {
                println!(
                    "▶ Resuming from {} ({} entries)",
                    output.display(),
                    existing.len()
                );
            }
            if update {
                let removed = prune_missing(&mut existing);
                println!("🧹 Removed {} entries of deleted files", removed.len());
            }

            let scanner = if all { Scanner::all() } else { Scanner::images() };
            let files = scan_directory(&scanner, &source, cli.verbose)?;
            let hasher = HashService::new(hashing.options()).context("Invalid hashing options")?;

            println!("▶ Hashing {} files…", files.len());
            let bar = progress_bar(files.len() as u64, cli.verbose)?;
            let (map, stats) = benchmark("hashing", || {
                MapBuilder::new(&hasher, &output)
                    .exact_fallback(all)
                    .build(&files, existing, |path| {
                        bar.set_message(file_label(path));
                        bar.inc(1);
                    })
            })
            .with_context(|| format!("Could not write hash file {}", output.display()))?;
            bar.finish_and_clear();

            println!(
                "✅ {} hashed, {} already known, {} skipped",
                stats.hashed, stats.skipped, stats.failed
            );
            println!("   {} entries in {}", map.len(), output.display());
        }

        Commands::Merge { files, output_path } => {
            let merged = read_and_merge(&files).context("Could not read hash files")?;
            let directory = output_path.unwrap_or_else(|| parent_dir(&files[0]));

            let merged_file = directory.join(MERGED_FILE_NAME);
            write_json(&merged_file, &merged)
                .with_context(|| format!("Could not write {}", merged_file.display()))?;
            println!(
                "✅ Merged {} files into {} ({} entries)",
                files.len(),
                merged_file.display(),
                merged.len()
            );

            let helper_file = directory.join(DUPLICATES_HELPER_FILE_NAME);
            let helper = DigestIndex::from_map(merged).reverse_map();
            write_json(&helper_file, &helper)
                .with_context(|| format!("Could not write {}", helper_file.display()))?;
            println!("✅ Wrote lookup helper {}", helper_file.display());
        }

        Commands::Duplicates { files, info } => {
            let merged = read_and_merge(&files).context("Could not read hash files")?;
            println!("▶ Looking for duplicates among {} files", merged.len());

            let groups = benchmark("grouping", || group_duplicates(&merged));
            if groups.is_empty() {
                println!("No duplicates found.");
            } else {
                println!("Found {} duplicate group(s):", groups.len());
                for (i, group) in groups.iter().enumerate() {
                    println!("\n✨ Group {}:", i + 1);
                    println!("   🏆 Keeping → {}", group.files()[0].display());
                    for dup in &group.files()[1..] {
                        println!("   ▶ {}", dup.display());
                    }
                }
            }

            let output = parent_dir(&files[0]).join(DUPLICATES_FILE_NAME);
            write_json(&output, &groups)
                .with_context(|| format!("Could not write {}", output.display()))?;
            println!("\n✅ Duplicate groups written to {}", output.display());

            if info {
                let stats = duplicate_stats(&groups);
                println!("📊 Kept files:       {}", HumanBytes(stats.unique_bytes));
                println!("📊 Duplicated files: {}", HumanBytes(stats.duplicate_bytes));
                if !stats.not_found.is_empty() {
                    println!("⚠️  {} files no longer on disk:", stats.not_found.len());
                    for path in &stats.not_found {
                        println!("   {}", path.display());
                    }
                }
            }
        }

        Commands::Sort {
            source,
            destination,
            no_rename,
            monthly,
            hash_file,
            no_perceptual,
            no_size_check,
            all,
            hashing,
            policy,
        } => {
            let mut config = PlacementConfig::new(source, destination);
            config.layout = if monthly { Layout::Monthly } else { Layout::Daily };
            config.no_rename = no_rename;
            config.size_precheck = !no_size_check;
            config.perceptual = !no_perceptual;
            config.hash_options = hashing.options();
            config.policy = policy.policy();
            config.hash_file = hash_file.clone();
            if all {
                config.selection = Selection::All;
            }

            let validated = config.validate()?;
            let source = validated.source().to_path_buf();
            let scanner = validated.scanner();
            println!(
                "▶ Sorting {} into {}",
                source.display(),
                validated.destination().display()
            );

            let mut engine = PlacementEngine::new(validated);
            if let Some(hash_file) = &hash_file {
                let known = read_digest_map(hash_file)
                    .with_context(|| format!("Could not read hash file {}", hash_file.display()))?;
                println!("▶ {} known pictures in {}", known.len(), hash_file.display());
                engine = engine.with_index(DigestIndex::from_map(known));
            }

            ctrlc::set_handler(|| {
                INTERRUPTED.store(true, Ordering::SeqCst);
                eprintln!("\nInterrupted, finishing the current file…");
            })
            .context("Failed to set signal handler")?;

            let files = scan_directory(&scanner, &source, cli.verbose)?;
            let bar = progress_bar(files.len() as u64, cli.verbose)?;
            let complete = benchmark("sorting", || {
                engine.run_with(&files, |file, outcome| {
                    bar.set_message(file_label(file));
                    if let Err(error) = outcome {
                        bar.println(format!("⚠️  {}: {}", file.display(), error));
                    }
                    bar.inc(1);
                    if INTERRUPTED.load(Ordering::SeqCst) {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                })
            });
            bar.finish_and_clear();
            if !complete {
                println!(
                    "⚠️  Interrupted after {} of {} files, saving progress",
                    engine.log().stats.total,
                    files.len()
                );
            }

            let (log, index) = engine.finish();
            let stats = log.stats;

            if !log.is_empty() {
                let log_file = log.default_path();
                write_json(&log_file, &log)
                    .with_context(|| format!("Could not write log {}", log_file.display()))?;
                println!("📝 Log written to {}", log_file.display());
            }

            if let (Some(hash_file), Some(index)) = (hash_file, index) {
                if stats.copied > 0 {
                    let backup = backup_file(&hash_file)
                        .with_context(|| format!("Could not back up {}", hash_file.display()))?;
                    write_json(&hash_file, &index.into_map()).with_context(|| {
                        format!("Could not update hash file {}", hash_file.display())
                    })?;
                    println!(
                        "📝 Hash file updated, previous version in {}",
                        backup.display()
                    );
                }
            }

            println!(
                "\n✅ {} files: {} copied, {} identical, {} skipped, {} errors",
                stats.total, stats.copied, stats.identical, stats.skipped, stats.errors
            );
        }

        Commands::Compare {
            first,
            second,
            hashing,
            policy,
        } => {
            let hasher = HashService::new(hashing.options()).context("Invalid hashing options")?;
            let a = hasher
                .hash_file_lenient(&first, true)
                .with_context(|| format!("Could not hash {}", first.display()))?;
            let b = hasher
                .hash_file_lenient(&second, true)
                .with_context(|| format!("Could not hash {}", second.display()))?;

            for (path, digests) in [(&first, &a), (&second, &b)] {
                println!("▶ {}", path.display());
                println!("   exact      {}", digests.exact);
                for (algorithm, bits) in &digests.perceptual {
                    println!("   {:<10} {}", algorithm.name(), bits);
                }
            }

            let comparator = Comparator::new(policy.policy());
            match comparator.compare(&a, &b) {
                Ok(score) => {
                    let verdict = if comparator.policy().matches(&score) {
                        "✅ same picture"
                    } else {
                        "❌ different pictures"
                    };
                    println!("\nScore: {}\n{}", score, verdict);
                }
                Err(error) => println!("\n⚠️  {}", error),
            }
        }
    }

    Ok(())
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

/// Recursively walk `dir` with a spinner, returning the selected files.
fn scan_directory(scanner: &Scanner, dir: &Path, verbose: u8) -> Result<Vec<PathBuf>> {
    let spinner = if verbose > 0 {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for files…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let files = scanner
        .scan_with(dir, |_| spinner.tick())
        .with_context(|| format!("Could not scan {}", dir.display()))?;

    spinner.finish_with_message(format!("Scan complete, {} files", files.len()));
    Ok(files)
}

/// Progress bar for `len` files, hidden when log output is on.
fn progress_bar(len: u64, verbose: u8) -> Result<ProgressBar> {
    if verbose > 0 {
        return Ok(ProgressBar::hidden());
    }

    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}")?
            .progress_chars("=> "),
    );
    Ok(bar)
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parent_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
