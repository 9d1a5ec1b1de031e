//! oxidized-pak command line
//!
//! - `inspect <file>` prints a package header as JSON
//! - `load <root> <name>...` loads packages through the async loader

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use op_core::config::Config;
use op_core::platform::HostPlatform;
use op_format::PackageHeader;
use op_io::{ContentPaths, IoDispatcher, NativeFileSystem};
use op_loader::resolve::import_identities;
use op_loader::{AsyncLoader, LoadCompletion, LoaderServices, ObjectStore};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Asynchronous dependency-aware package loader
#[derive(Debug, Parser)]
#[command(name = "oxidized-pak", version)]
struct Cli {
    /// Configuration file (defaults are used when absent)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the header of a package file as JSON
    Inspect {
        file: PathBuf,
    },
    /// Load packages from a content root and report each result
    Load(LoadArgs),
}

#[derive(Debug, Parser)]
struct LoadArgs {
    /// Directory holding the package files
    root: PathBuf,

    /// Package names, e.g. `/Game/Maps/Entry`
    #[arg(required = true)]
    names: Vec<String>,

    /// Tick on this thread instead of a dedicated loading thread
    #[arg(long)]
    single_thread: bool,

    /// Print load statistics as JSON when done
    #[arg(long)]
    stats: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("reading config {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env_overrides(&HostPlatform);
    op_core::logging::init(&config.debug);

    match cli.command {
        Command::Inspect { file } => inspect(&file),
        Command::Load(args) => load(config, args),
    }
}

fn read_header(path: &Path) -> anyhow::Result<PackageHeader> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    PackageHeader::parse(&data).with_context(|| format!("parsing {}", path.display()))
}

fn inspect(file: &Path) -> anyhow::Result<()> {
    let header = read_header(file)?;
    println!("{}", serde_json::to_string_pretty(&header)?);
    Ok(())
}

/// Register every script class reachable from `names` so imports of it resolve
fn register_script_imports(store: &ObjectStore, paths: &ContentPaths, names: &[String]) -> usize {
    let mut queue: VecDeque<String> = names.iter().cloned().collect();
    let mut seen: HashSet<String> = queue.iter().cloned().collect();
    let mut registered = 0;

    while let Some(name) = queue.pop_front() {
        let Some(files) = paths.resolve(&name) else {
            continue;
        };
        let header = match read_header(&files.header) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!("Skipping script scan of {}: {:#}", name, e);
                continue;
            }
        };
        for identity in import_identities(&header) {
            if identity.is_script() {
                let prefix = format!("{}.", identity.package);
                if let Some(class) = identity.path.strip_prefix(&prefix) {
                    if store.find(&identity.path).is_none() {
                        store.register_native_class(&identity.package, class);
                        registered += 1;
                    }
                }
            } else if seen.insert(identity.package.clone()) {
                queue.push_back(identity.package);
            }
        }
    }
    registered
}

fn load(mut config: Config, args: LoadArgs) -> anyhow::Result<()> {
    config.paths.content_root = args.root.clone();
    if args.single_thread {
        config.general.multithreaded = false;
    }

    let workers = config.io_worker_count(&HostPlatform);
    let dispatcher = Arc::new(IoDispatcher::new(workers));
    let services = LoaderServices::new(Arc::new(NativeFileSystem::new(dispatcher)));

    let paths = ContentPaths::new(&config.paths);
    let registered = register_script_imports(&services.store, &paths, &args.names);
    tracing::info!("Registered {} script classes", registered);

    let mut loader = AsyncLoader::new(config, services).context("starting loader")?;
    let completions: Arc<Mutex<Vec<LoadCompletion>>> = Arc::default();
    for name in &args.names {
        let sink = Arc::clone(&completions);
        loader.enqueue(
            name,
            None,
            None,
            0,
            Default::default(),
            Some(Box::new(move |completion| {
                sink.lock().push(completion.clone());
            })),
        );
    }

    let flushed = loader.flush(None);

    let mut failures = 0;
    for completion in completions.lock().iter() {
        if !completion.result.is_success() {
            failures += 1;
        }
        println!("{}: {}", completion.name, completion.result);
    }
    if args.stats {
        println!("{}", serde_json::to_string_pretty(&loader.stats())?);
    }
    loader.shutdown();

    flushed.context("flushing loads")?;
    if failures > 0 {
        bail!("{} of {} packages failed to load", failures, args.names.len());
    }
    Ok(())
}
