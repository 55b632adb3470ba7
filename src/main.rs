use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vm_import::{
    AdapterResolver, ExportContext, ImportConfig, MemoryPlatform, MigrationRequest, logger,
    converter::{DiskFormat, QemuImg},
    preflight,
    reconciler::Context,
    source::{Secret, SourceCluster},
    source_controller,
    sources::ova::{archive, envelope},
};

#[derive(Parser)]
#[command(name = "vm-import")]
#[command(about = "Import virtual machines from VMware, OpenStack, OVA and KVM sources")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the manifest and hardware description of a local OVA
    InspectOva {
        /// Path to the .ova archive
        path: PathBuf,
    },
    /// Convert a disk image to raw
    Convert {
        /// Source format (vmdk, qcow2, raw)
        #[arg(short, long)]
        format: String,
        source: PathBuf,
        destination: PathBuf,
    },
    /// Verify connectivity of the source cluster described in a manifest
    CheckSource {
        /// TOML manifest with a [source] table and optional [secret]
        manifest: PathBuf,
    },
    /// Run the offline checks on the migration request in a manifest
    Validate {
        /// TOML manifest with a [migration] table
        manifest: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

/// Objects read from a manifest file.
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    source: Option<SourceCluster>,
    #[serde(default)]
    secret: Option<Secret>,
    #[serde(default)]
    migration: Option<MigrationRequest>,
}

impl Manifest {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing manifest {}", path.display()))
    }
}

fn inspect_ova(path: &Path) -> anyhow::Result<()> {
    let descriptors = archive::read_descriptors(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let envelope = envelope::parse(&descriptors.ovf)?;
    let manifest = match &descriptors.manifest {
        Some(content) => archive::Manifest::parse(content)?,
        None => archive::Manifest::default(),
    };
    let source = envelope.source_vm()?;

    let disks: Vec<_> = envelope
        .disk_layout(vm_import::migration::DiskBus::Virtio)?
        .into_iter()
        .map(|disk| {
            json!({
                "file": disk.file.href,
                "capacity_bytes": disk.capacity_bytes,
                "bus": disk.bus.as_str(),
                "format": disk.format_hint,
                "checksum": manifest.get(&disk.file.href).map(|e| e.digest.clone()),
            })
        })
        .collect();

    let summary = json!({
        "name": envelope.name,
        "descriptor": descriptors.ovf_name,
        "cpu_cores": source.cpu_cores,
        "memory_bytes": source.memory_bytes,
        "firmware": source.firmware,
        "tpm": source.tpm,
        "networks": envelope.networks,
        "nics": source.nics,
        "disks": disks,
        "manifest_entries": manifest.entries.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn check_source(config: ImportConfig, manifest: Manifest) -> anyhow::Result<()> {
    let Some(cluster) = manifest.source else {
        bail!("manifest has no [source] table");
    };
    let reference = cluster.reference();

    let platform = MemoryPlatform::new();
    platform.insert_source_cluster(cluster)?;
    if let Some(secret) = manifest.secret {
        platform.insert_secret(secret)?;
    }

    let resolver = AdapterResolver::new(ExportContext::from_config(&config)?);
    let ctx = Context::new(
        Arc::new(platform.clone()),
        Arc::new(resolver),
        Arc::new(config),
    );
    source_controller::reconcile_source(&ctx, &reference).await?;

    let cluster = platform
        .source_cluster(&reference.key())?
        .context("source cluster vanished")?;
    println!("{}", serde_json::to_string_pretty(&cluster.status)?);
    if !cluster.is_ready() {
        bail!("{} is not ready", reference);
    }
    Ok(())
}

fn validate(manifest: Manifest) -> anyhow::Result<()> {
    let Some(request) = manifest.migration else {
        bail!("manifest has no [migration] table");
    };
    let summary = preflight::check_request(&request);
    print!("{}", summary);
    if !summary.is_ready() {
        bail!("{} issue(s) found", summary.issues.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(ImportConfig::default_path);
    let config = ImportConfig::load_or_default(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    logger::init(&config.log_level, cli.verbose);

    match cli.command {
        Commands::InspectOva { path } => inspect_ova(&path)?,
        Commands::Convert {
            format,
            source,
            destination,
        } => {
            let format: DiskFormat = format.parse()?;
            QemuImg::new(&config.qemu_img_path)
                .convert(format, &source, &destination)
                .await
                .with_context(|| format!("converting {}", source.display()))?;
            println!("Wrote {}", destination.display());
        }
        Commands::CheckSource { manifest } => {
            check_source(config, Manifest::load(&manifest)?).await?
        }
        Commands::Validate { manifest } => validate(Manifest::load(&manifest)?)?,
        Commands::Config => {
            println!("# {}", config_path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
