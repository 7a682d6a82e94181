//! cloudfs-fuse - mount a remote cloud-storage account with FUSE.

use clap::{Parser, Subcommand};
use cloudfs_fuse::client::CloudClient;
use cloudfs_fuse::config::{DiskCacheConfig, FsConfig, WriterPolicy};
use cloudfs_fuse::disk_cache::{PersistentCache, DEFAULT_MAX_SIZE};
use cloudfs_fuse::fuse::FuseAdapter;
use cloudfs_fuse::memory::MemoryStorage;
use cloudfs_fuse::remote::RemoteStorage;
use cloudfs_fuse::retry::RetryPolicy;
use cloudfs_fuse::CloudFs;
use fuser::MountOption;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "cloudfs-fuse")]
#[command(about = "Mount a remote cloud-storage account as a filesystem")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the remote account
    Mount {
        /// Mount point path
        #[arg(value_name = "MOUNT_POINT")]
        mount_point: PathBuf,

        /// Remote storage API base URL
        #[arg(long, env = "CLOUDFS_URL", required_unless_present = "memory")]
        url: Option<String>,

        /// Bearer capability token
        #[arg(long, env = "CLOUDFS_TOKEN", hide_env_values = true, required_unless_present = "memory")]
        token: Option<String>,

        /// Mount an empty in-memory store instead of a remote account
        #[arg(long, default_value = "false")]
        memory: bool,

        /// Seconds file attributes stay fresh
        #[arg(long, env = "CLOUDFS_ATTR_TTL", default_value = "5")]
        attr_ttl: u64,

        /// Seconds directory listings stay fresh
        #[arg(long, env = "CLOUDFS_DIR_TTL", default_value = "5")]
        dir_ttl: u64,

        /// In-memory content cache budget in MiB
        #[arg(long, env = "CLOUDFS_CACHE_MB", default_value = "256")]
        cache_mb: u64,

        /// Download chunk size in KiB
        #[arg(long, default_value = "4096")]
        chunk_kb: u64,

        /// Staged writes larger than this (MiB) spill to a temp file
        #[arg(long, default_value = "5")]
        spool_mb: u64,

        /// Second writer on a dirty file: reject or queue
        #[arg(long, env = "CLOUDFS_WRITER_POLICY", default_value = "reject")]
        writer_policy: WriterPolicy,

        /// Attempts per remote call before giving up
        #[arg(long, default_value = "5")]
        retries: u32,

        /// Seconds a path lock wait may take before failing with EAGAIN
        #[arg(long, default_value = "30")]
        lock_timeout: u64,

        /// Disable the persistent content cache
        #[arg(long, default_value = "false")]
        no_disk_cache: bool,

        /// Directory for the persistent content cache
        #[arg(long, env = "CLOUDFS_CACHE_DIR")]
        cache_dir: Option<PathBuf>,

        /// Persistent cache size limit in MiB
        #[arg(long, default_value_t = DEFAULT_MAX_SIZE / MIB)]
        disk_cache_mb: u64,

        /// Allow other users to access the mount
        #[arg(long, default_value = "false")]
        allow_other: bool,

        /// Run in foreground (don't daemonize)
        #[arg(long, short = 'f', default_value = "false")]
        foreground: bool,
    },
    /// Check version
    Version,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Mount {
            mount_point,
            url,
            token,
            memory,
            attr_ttl,
            dir_ttl,
            cache_mb,
            chunk_kb,
            spool_mb,
            writer_policy,
            retries,
            lock_timeout,
            no_disk_cache,
            cache_dir,
            disk_cache_mb,
            allow_other,
            foreground,
        } => {
            info!("cloudfs-fuse starting...");
            info!("Mount point: {}", mount_point.display());

            let config = FsConfig {
                attr_ttl: Duration::from_secs(attr_ttl),
                dir_ttl: Duration::from_secs(dir_ttl),
                cache_budget: cache_mb * MIB,
                chunk_size: (chunk_kb * 1024).max(4096),
                spool_threshold: spool_mb * MIB,
                writer_policy,
                retry: RetryPolicy {
                    max_attempts: retries.max(1),
                    ..RetryPolicy::default()
                },
                lock_timeout: Duration::from_secs(lock_timeout),
                disk_cache: (!no_disk_cache && !memory).then(|| DiskCacheConfig {
                    dir: cache_dir,
                    max_size: disk_cache_mb * MIB,
                }),
            };

            let (remote, remote_key): (Arc<dyn RemoteStorage>, String) = match (memory, url, token) {
                (true, _, _) => {
                    info!("Using an in-memory store; contents vanish at unmount");
                    (Arc::new(MemoryStorage::new()), "memory".to_string())
                }
                (false, Some(url), Some(token)) => {
                    info!("Server URL: {}", url);
                    let client = CloudClient::new(&url, &token)?;

                    info!("Connecting to remote storage...");
                    match client.whoami() {
                        Ok(account) => {
                            let who = account
                                .display_name
                                .as_deref()
                                .or(account.email.as_deref())
                                .or(account.account_id.as_deref())
                                .unwrap_or("unknown");
                            info!("Authenticated as {}", who);
                        }
                        Err(e) => {
                            error!("Failed to authenticate: {}", e);
                            return Err(e.into());
                        }
                    }
                    (Arc::new(client), url)
                }
                _ => anyhow::bail!("--url and --token are required unless --memory is set"),
            };

            let disk = match &config.disk_cache {
                Some(dc) => match PersistentCache::open(dc.dir.as_deref(), &remote_key, dc.max_size) {
                    Ok(cache) => {
                        let stats = cache.stats();
                        info!(
                            "Disk cache loaded: {} chunks ({} MB)",
                            stats.chunk_count,
                            stats.total_size / MIB
                        );
                        Some(Arc::new(cache))
                    }
                    Err(e) => {
                        warn!("Failed to initialize disk cache: {} (continuing without it)", e);
                        None
                    }
                },
                None => None,
            };

            let fs = Arc::new(CloudFs::new(remote, config, disk));
            let adapter = FuseAdapter::new(Arc::clone(&fs))?;

            let mut options = vec![
                MountOption::FSName("cloudfs".to_string()),
                MountOption::AutoUnmount,
                MountOption::DefaultPermissions,
            ];
            if allow_other {
                options.push(MountOption::AllowOther);
            }

            if !foreground {
                info!("Daemon mode is not supported, running in the foreground");
            }
            info!("Mounting filesystem...");
            fuser::mount2(adapter, &mount_point, &options)?;

            // destroy() normally ran already; this is a no-op then.
            fs.shutdown();
            info!("Filesystem unmounted");
        }
        Commands::Version => {
            println!("cloudfs-fuse {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
