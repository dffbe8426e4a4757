use crate::bootstrap::{bootstrap_or_exit, BootstrapPlan};
use crate::config::manifest::Manifest;
use crate::config::settings::PalConfig;
use crate::kernel::host::HostCalls;
use crate::kernel::LinuxHost;
use crate::loader::{DebugSnapshot, ImageKind, LoaderOptions, LoaderRegistry, MappedImage};
use crate::policy::{compile, DryRunInstaller, MonitorInstaller, PolicyInstaller, PolicyRule};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Runtime configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the sandbox policy for a manifest and print it
    Policy {
        /// Manifest file (JSON)
        #[arg(long)]
        manifest: PathBuf,
        /// Default rules placed ahead of the manifest rules (JSON array)
        #[arg(long)]
        defaults: Option<PathBuf>,
        /// Install the compiled policy through the policy device
        #[arg(long)]
        install: bool,
    },
    /// Load ELF images into a fresh registry and print the link map list
    Inspect {
        /// Images to load, in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Relocate the images instead of registering them as prelinked
        #[arg(long)]
        relocate: bool,
        /// Resolve this symbol after loading
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Run the bootstrap sequence against the running executable
    Bootstrap {
        /// Manifest file (JSON)
        #[arg(long)]
        manifest: PathBuf,
        /// Install the compiled policy through the policy device
        #[arg(long)]
        install: bool,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PalConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => PalConfig::default(),
    };
    let host: Arc<dyn HostCalls> = Arc::new(LinuxHost::new());

    match cli.command {
        Commands::Policy {
            manifest,
            defaults,
            install,
        } => run_policy(host, &config, &manifest, defaults.as_deref(), install),
        Commands::Inspect {
            files,
            relocate,
            symbol,
        } => run_inspect(host, &config, &files, relocate, symbol.as_deref()),
        Commands::Bootstrap { manifest, install } => {
            run_bootstrap(host, config, &manifest, install)
        }
    }
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    Manifest::load(path).with_context(|| format!("loading manifest {}", path.display()))
}

fn load_defaults(path: Option<&Path>) -> Result<Vec<PolicyRule>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading default rules {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("parsing default rules {}", path.display()))
}

fn installer_for(
    host: Arc<dyn HostCalls>,
    config: &PalConfig,
    install: bool,
) -> Result<Box<dyn PolicyInstaller>> {
    if install {
        Ok(Box::new(MonitorInstaller::new(host, &config.policy_device)?))
    } else {
        Ok(Box::new(DryRunInstaller))
    }
}

fn run_policy(
    host: Arc<dyn HostCalls>,
    config: &PalConfig,
    manifest: &Path,
    defaults: Option<&Path>,
    install: bool,
) -> Result<()> {
    let manifest = load_manifest(manifest)?;
    let defaults = load_defaults(defaults)?;
    let policy = compile(&manifest, &defaults)?;

    let report = serde_json::json!({
        "fingerprint": policy.fingerprint(),
        "sources": policy.sources(),
        "rules": policy.rules(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if install {
        let installer = installer_for(host, config, true)?;
        let installed = policy.install(installer.as_ref())?;
        eprintln!("Installed {} rules", installed.rules().len());
    }
    Ok(())
}

fn run_inspect(
    host: Arc<dyn HostCalls>,
    config: &PalConfig,
    files: &[PathBuf],
    relocate: bool,
    symbol: Option<&str>,
) -> Result<()> {
    let mut registry = LoaderRegistry::new(
        host,
        LoaderOptions {
            reserve_gaps: config.reserve_image_gaps,
        },
    );
    let transitions: Arc<Mutex<Vec<DebugSnapshot>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    registry.set_observer(Box::new(move |snapshot: &DebugSnapshot| {
        if let Ok(mut seen) = sink.lock() {
            seen.push(snapshot.clone());
        }
    }));

    for (index, file) in files.iter().enumerate() {
        let kind = match (relocate, index) {
            (false, _) => ImageKind::Rtld,
            (true, 0) => ImageKind::Executable,
            (true, _) => ImageKind::Library,
        };
        let name = file.display().to_string();
        let image = MappedImage::map_file(file).with_context(|| format!("mapping {}", name))?;
        registry
            .load(&name, image, kind)
            .with_context(|| format!("loading {}", name))?;
    }

    println!("Link map list (newest first):");
    for map in registry.maps() {
        println!(
            "  {} [{:?} {:?}] base={:#x} bias={:#x} entry={:#x}",
            map.name(),
            map.kind(),
            map.machine(),
            map.image().base(),
            map.load_bias(),
            map.entry()
        );
        if let Some(soname) = map.soname() {
            println!("    soname: {}", soname);
        }
        for needed in map.needed() {
            println!("    needed: {}", needed);
        }
    }

    println!("Debug state transitions:");
    let seen = transitions.lock().map(|s| s.clone()).unwrap_or_default();
    for snapshot in seen {
        println!("  {:?} ({} entries)", snapshot.phase, snapshot.entries.len());
    }

    if let Some(symbol) = symbol {
        match registry.lookup(symbol) {
            Some((map, addr)) => println!("{} = {:#x} in {}", symbol, addr, map.name()),
            None => anyhow::bail!("symbol {} not found", symbol),
        }
    }
    Ok(())
}

fn run_bootstrap(
    host: Arc<dyn HostCalls>,
    config: PalConfig,
    manifest: &Path,
    install: bool,
) -> Result<()> {
    let manifest = load_manifest(manifest)?;
    let installer = installer_for(host.clone(), &config, install)?;
    let runtime = bootstrap_or_exit(
        host,
        config,
        &manifest,
        BootstrapPlan::current_executable(),
        installer.as_ref(),
    );

    println!("Images:");
    for map in runtime.registry().maps() {
        println!("  {} [{:?}]", map.name(), map.kind());
    }
    println!(
        "Policy: {} rules, fingerprint {}",
        runtime.policy().rules().len(),
        runtime.policy().fingerprint()
    );
    println!("Fast clock: {}", runtime.has_fast_clock());
    Ok(())
}
