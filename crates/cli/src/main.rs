//! Command-line driver for the larder cache engine.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use larder_core::{DownloadStatus, FileId, FileLink, RemoteFile, Version};
use larder_engine::{
    Engine, EngineEvent, EngineResult, EventFilter, FileAction, InvalidateScope, QueueState,
    ResolveOptions, SizeCheck, StaticNetwork, StaticSite,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "larderctl")]
#[command(about = "Fetch, cache and inspect remote files with larder")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, env = "LARDER_CONFIG", default_value = "larder.toml")]
    config: PathBuf,

    #[command(flatten)]
    site: SiteArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SiteArgs {
    /// Site the files belong to
    #[arg(long, env = "LARDER_SITE", default_value = "default")]
    site: String,

    /// Token appended to remote URLs before fetching
    #[arg(long, env = "LARDER_SITE_TOKEN")]
    token: Option<String>,

    /// Behave as if the device had no network
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// Treat the connection as metered (smaller auto-download threshold)
    #[arg(long, default_value_t = false)]
    metered: bool,
}

#[derive(Args, Clone, Default)]
struct ComponentArgs {
    /// Component the files belong to
    #[arg(long)]
    component: Option<String>,

    /// Instance of the component
    #[arg(long, requires = "component")]
    component_id: Option<String>,
}

impl ComponentArgs {
    fn link(&self) -> Option<FileLink> {
        self.component
            .as_ref()
            .map(|component| FileLink::new(component.clone(), self.component_id.as_deref()))
    }
}

#[derive(Args, Clone)]
struct PackageArgs {
    /// Component owning the package
    #[arg(long)]
    component: String,

    /// Instance of the component
    #[arg(long)]
    component_id: String,

    /// Opaque value stored with the package status
    #[arg(long)]
    extra: Option<String>,

    /// Files of the package
    #[arg(value_name = "URL", required = true, num_args = 1..)]
    urls: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print where a remote file can be read from, queueing it if needed
    Resolve {
        url: String,
        #[command(flatten)]
        component: ComponentArgs,
        /// Print a file:// URL for local copies
        #[arg(long, default_value_t = false)]
        src: bool,
        /// Only queue the download if the file is small enough
        #[arg(long, default_value_t = false)]
        size_check: bool,
        /// With --size-check, queue regardless of size
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Queue priority of the background download
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Wait up to this many seconds for the background download
        #[arg(long)]
        wait: Option<u64>,
    },
    /// Download the files of a package now
    Download {
        #[command(flatten)]
        package: PackageArgs,
    },
    /// Download the files of a package through the queue
    Prefetch {
        #[command(flatten)]
        package: PackageArgs,
    },
    /// Download one file now and print its local path
    Fetch {
        url: String,
        #[command(flatten)]
        component: ComponentArgs,
        /// Accept a stale local copy
        #[arg(long, default_value_t = false)]
        ignore_stale: bool,
    },
    /// Show the status of files or a package
    Status {
        /// Files to check
        #[arg(value_name = "URL", num_args = 0..)]
        urls: Vec<String>,
        #[command(flatten)]
        component: ComponentArgs,
    },
    /// List stored files
    Files {
        #[command(flatten)]
        component: ComponentArgs,
    },
    /// Mark stored files or a package as outdated
    Invalidate {
        /// Invalidate one file
        #[arg(long, conflicts_with_all = ["component", "package"])]
        url: Option<String>,
        #[command(flatten)]
        component: ComponentArgs,
        /// Include files whose freshness can be checked against the remote
        #[arg(long, default_value_t = false)]
        all: bool,
        /// Mark the component's package outdated instead of its files
        #[arg(long, default_value_t = false, requires = "component_id")]
        package: bool,
    },
    /// Delete stored files
    Remove {
        /// Remove one file
        #[arg(long, conflicts_with = "component")]
        url: Option<String>,
        #[command(flatten)]
        component: ComponentArgs,
        /// Forget every package status of the site
        #[arg(long, default_value_t = false)]
        packages: bool,
    },
    /// Download queue commands
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Print engine counters in Prometheus text format
    Stats,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued files
    List {
        /// Show every site
        #[arg(long, default_value_t = false)]
        all_sites: bool,
    },
    /// Add a file to the queue and wait for it while online
    Add {
        url: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[command(flatten)]
        component: ComponentArgs,
    },
    /// Process the queue until it is empty or the network goes away
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "larder=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = config::load(&cli.config)?;
    let network = Arc::new(StaticNetwork::new(!cli.site.offline, cli.site.metered));
    let engine = larder_engine::from_config(&config, network)
        .await
        .context("failed to initialize cache engine")?;

    let mut site = StaticSite::new(cli.site.site.clone());
    if let Some(token) = &cli.site.token {
        site = site.with_token(token.clone());
    }
    engine.register_site(Arc::new(site));

    run(&engine, &cli.site.site, cli.command).await
}

async fn resolve(
    engine: &Engine,
    site_id: &str,
    url: &str,
    src: bool,
    options: ResolveOptions,
) -> EngineResult<String> {
    let file = RemoteFile::url(url);
    if src {
        engine.resolve_src(site_id, file, options).await
    } else {
        engine.resolve_url(site_id, file, options).await
    }
}

async fn run(engine: &Engine, site_id: &str, command: Commands) -> Result<()> {
    match command {
        Commands::Resolve {
            url,
            component,
            src,
            size_check,
            force,
            priority,
            wait,
        } => {
            let file_id = FileId::from_url(&url);
            let mut events = engine.subscribe(EventFilter::File {
                site_id: site_id.to_string(),
                file_id: file_id.to_string(),
            });
            let options = ResolveOptions {
                link: component.link(),
                priority,
                size_check: size_check.then_some(SizeCheck {
                    force,
                    download_unknown: false,
                }),
            };
            let location = resolve(engine, site_id, &url, src, options.clone()).await?;

            let Some(secs) = wait else {
                println!("{location}");
                return Ok(());
            };
            if engine.get_file_state(site_id, &url, Version::default()).await?
                == DownloadStatus::Downloaded
            {
                println!("{location}");
                return Ok(());
            }

            let finished = tokio::time::timeout(Duration::from_secs(secs), async {
                while let Some(event) = events.recv().await {
                    match event {
                        EngineEvent::File(e) if e.action == FileAction::Download => {
                            return e.success;
                        }
                        _ => {}
                    }
                }
                None
            })
            .await;
            match finished {
                Ok(Some(true)) => {
                    engine.wait_until_idle().await;
                    println!("{}", resolve(engine, site_id, &url, src, options).await?);
                }
                Ok(_) => anyhow::bail!("background download of {url} failed"),
                Err(_) => {
                    eprintln!("Download not finished after {secs}s.");
                    println!("{location}");
                }
            }
        }
        Commands::Download { package } => {
            let files = package.urls.iter().map(RemoteFile::url).collect();
            engine
                .download_package(
                    site_id,
                    files,
                    &package.component,
                    &package.component_id,
                    package.extra,
                )
                .await
                .with_context(|| format!("failed to download package {}", package.component_id))?;
            println!(
                "Package {}/{} downloaded ({} files).",
                package.component,
                package.component_id,
                package.urls.len()
            );
        }
        Commands::Prefetch { package } => {
            let files = package.urls.iter().map(RemoteFile::url).collect();
            engine
                .prefetch_package(
                    site_id,
                    files,
                    &package.component,
                    &package.component_id,
                    package.extra,
                )
                .await
                .with_context(|| format!("failed to prefetch package {}", package.component_id))?;
            println!(
                "Package {}/{} prefetched ({} files).",
                package.component,
                package.component_id,
                package.urls.len()
            );
        }
        Commands::Fetch {
            url,
            component,
            ignore_stale,
        } => {
            let path = engine
                .download_url(site_id, RemoteFile::url(&url), component.link(), ignore_stale)
                .await
                .with_context(|| format!("failed to download {url}"))?;
            println!("{}", path.display());
        }
        Commands::Status { urls, component } => {
            if !urls.is_empty() {
                println!("{:<12} URL", "Status");
                println!("{}", "-".repeat(80));
                for url in &urls {
                    let status = engine.get_file_state(site_id, url, Version::default()).await?;
                    println!("{:<12} {}", status.to_string(), url);
                }
                let files = urls.iter().map(RemoteFile::url).collect();
                println!("\nOverall: {}", engine.get_files_status(site_id, files).await?);
            }
            match (&component.component, &component.component_id) {
                (Some(name), Some(id)) => {
                    let status = engine.get_package_status(site_id, name, id).await?;
                    println!("Package {name}/{id}: {status}");
                    if let Some(row) = engine.get_package_data(site_id, name, id).await? {
                        if let Some(previous) = &row.previous_status {
                            println!("Previous status: {previous}");
                        }
                        if let Some(at) = row.download_time {
                            println!("Downloaded: {at}");
                        }
                        if let Some(extra) = &row.extra {
                            println!("Extra: {extra}");
                        }
                    }
                }
                (name, None) if name.is_some() || urls.is_empty() => {
                    let packages = engine.list_packages(site_id, name.as_deref()).await?;
                    if packages.is_empty() {
                        println!("No packages found.");
                        return Ok(());
                    }
                    println!("{:<20} {:<20} {:<16} Updated", "Component", "ID", "Status");
                    println!("{}", "-".repeat(80));
                    for row in packages {
                        println!(
                            "{:<20} {:<20} {:<16} {}",
                            row.component, row.component_id, row.status, row.updated_at
                        );
                    }
                }
                _ => {}
            }
        }
        Commands::Files { component } => {
            let files = match &component.component {
                Some(name) => {
                    engine
                        .get_files_by_component(site_id, name, component.component_id.as_deref())
                        .await?
                }
                None => engine.list_files(site_id).await?,
            };
            if files.is_empty() {
                println!("No files found.");
                return Ok(());
            }
            println!("{:<48} {:>10} {:<6} URL", "File ID", "Size", "Stale");
            println!("{}", "-".repeat(100));
            for file in &files {
                println!(
                    "{:<48} {:>10} {:<6} {}",
                    file.file_id, file.size, file.stale, file.url
                );
            }
            if let Some(name) = &component.component {
                let usage = engine
                    .get_component_disk_usage(site_id, name, component.component_id.as_deref())
                    .await?;
                println!("\nDisk usage: {usage} bytes");
            }
        }
        Commands::Invalidate {
            url,
            component,
            all,
            package,
        } => {
            if let Some(url) = url {
                if engine.invalidate_file(site_id, &url).await? {
                    println!("Invalidated {url}");
                } else {
                    println!("{url} is not stored.");
                }
                return Ok(());
            }
            if package {
                let (Some(name), Some(id)) = (&component.component, &component.component_id)
                else {
                    anyhow::bail!("--package needs --component and --component-id");
                };
                if engine.invalidate_package(site_id, name, id).await? {
                    println!("Package {name}/{id} marked outdated.");
                } else {
                    println!("Package {name}/{id} has no stored status.");
                }
                return Ok(());
            }
            let scope = match component.component {
                Some(name) => InvalidateScope::Component {
                    component: name,
                    component_id: component.component_id,
                },
                None => InvalidateScope::All,
            };
            let marked = engine.invalidate(site_id, scope, !all).await?;
            println!("Invalidated {marked} files.");
        }
        Commands::Remove {
            url,
            component,
            packages,
        } => {
            if let Some(url) = url {
                if engine.remove_file_by_url(site_id, &url).await? {
                    println!("Removed {url}");
                } else {
                    println!("{url} is not stored.");
                }
            } else if let Some(name) = &component.component {
                let removed = engine
                    .remove_files_by_component(site_id, name, component.component_id.as_deref())
                    .await?;
                println!("Removed {removed} files.");
            } else if !packages {
                anyhow::bail!("one of --url, --component or --packages is required");
            }
            if packages {
                let cleared = engine.clear_all_packages_status(site_id).await?;
                println!("Cleared {cleared} package statuses.");
            }
        }
        Commands::Queue { command } => match command {
            QueueCommands::List { all_sites } => {
                let site_filter = (!all_sites).then_some(site_id);
                let entries = engine.queue_entries(site_filter).await?;
                if entries.is_empty() {
                    println!("Queue is empty.");
                    return Ok(());
                }
                println!("{:<16} {:>8} {:<48} URL", "Site", "Priority", "File ID");
                println!("{}", "-".repeat(100));
                for entry in entries {
                    println!(
                        "{:<16} {:>8} {:<48} {}",
                        entry.site_id, entry.priority, entry.file_id, entry.url
                    );
                }
            }
            QueueCommands::Add {
                url,
                priority,
                component,
            } => {
                let task = engine
                    .add_to_queue(site_id, RemoteFile::url(&url), priority, component.link())
                    .await
                    .with_context(|| format!("failed to queue {url}"))?;
                if engine.queue_state() == QueueState::Paused {
                    println!("Queued {url} (queue paused)");
                    return Ok(());
                }
                task.wait()
                    .await
                    .with_context(|| format!("failed to download {url}"))?;
                println!("Downloaded {url}");
            }
            QueueCommands::Run => {
                engine.start().await?;
                engine.wait_until_idle().await;
                let remaining = engine.queue_entries(None).await?.len();
                println!("Queue {:?}, {remaining} entries left.", engine.queue_state());
            }
        },
        Commands::Stats => {
            let files = engine.list_files(site_id).await?;
            let bytes: i64 = files.iter().map(|f| f.size).sum();
            let queued = engine.queue_entries(None).await?.len();
            let packages = engine.list_packages(site_id, None).await?.len();
            println!(
                "# site {site_id}: {} files, {bytes} bytes, {packages} packages, {queued} queued",
                files.len()
            );
            let rendered =
                larder_engine::metrics::render().context("failed to render metrics")?;
            print!("{rendered}");
        }
    }
    Ok(())
}
