use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum UpdateStrategy {
    /// Snapshot the container, swap the update file in place, roll back on
    /// failure.
    Files,
    /// Rebuild the container from a new base image, carrying the world
    /// data over through a host-side archive.
    Image,
}

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Address to bind the API to
    #[arg(long, env = "BIND_ADDRESS", default_value = "127.0.0.1:8000")]
    pub address: SocketAddr,

    /// Connection string of the fleet database
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://skyblock.sqlite")]
    pub database_url: String,

    /// Path to the LXD unix socket
    #[arg(
        long,
        env = "LXD_SOCKET_PATH",
        default_value = "/var/snap/lxd/common/lxd/unix.socket"
    )]
    pub lxd_socket_path: PathBuf,

    /// LXD project the fleet's containers live in
    #[arg(long, env = "LXD_PROJECT", default_value = "default")]
    pub lxd_project: String,

    /// Image alias cloned for every new island
    #[arg(long, env = "LXD_BASE_IMAGE", default_value = "skyblock-template")]
    pub lxd_base_image: String,

    /// Seconds before a hypervisor operation is abandoned
    #[arg(long, env = "LXD_OPERATION_TIMEOUT", default_value_t = 30)]
    pub lxd_operation_timeout: u64,

    /// How many times to poll for a started container's IPv4
    #[arg(long, env = "LXD_IP_RETRY_ATTEMPTS", default_value_t = 10)]
    pub lxd_ip_retry_attempts: u32,

    /// Seconds between IPv4 polls
    #[arg(long, env = "LXD_IP_RETRY_DELAY", default_value_t = 3)]
    pub lxd_ip_retry_delay: u64,

    /// Profiles applied to every cloned container
    #[arg(
        long,
        env = "LXD_DEFAULT_PROFILES",
        default_value = "default,skyblock",
        value_delimiter = ','
    )]
    pub lxd_default_profiles: Vec<String>,

    /// Cap on islands in status RUNNING
    #[arg(long, env = "MAX_RUNNING_SERVERS", default_value_t = 10)]
    pub max_running_servers: u32,

    /// Minecraft port inside the container
    #[arg(
        long,
        env = "DEFAULT_MC_PORT_INTERNAL",
        default_value_t = skyblock_common::constants::DEFAULT_MC_PORT_INTERNAL
    )]
    pub default_mc_port: u16,

    #[arg(long, env = "UPDATE_STRATEGY", value_enum, default_value = "files")]
    pub update_strategy: UpdateStrategy,

    /// Base image used by the image update strategy
    #[arg(long, env = "LXD_NEW_BASE_IMAGE", default_value = "skyblock-template-new")]
    pub lxd_new_base_image: String,

    /// Host path of the file pushed by the files update strategy
    #[arg(
        long,
        env = "ISLAND_UPDATE_FILE_SOURCE_PATH",
        default_value = "/opt/skyblock_updates/new_config.jar"
    )]
    pub update_file_source: PathBuf,

    /// In-container destination of the pushed update file
    #[arg(
        long,
        env = "ISLAND_UPDATE_FILE_TARGET_PATH",
        default_value = "/opt/minecraft/mods/some_mod.jar"
    )]
    pub update_file_target: String,

    #[arg(long, env = "UPDATE_WORKER_MAX_RETRIES", default_value_t = 3)]
    pub update_max_retries: u32,

    /// Seconds between update-queue scans when no signal arrives
    #[arg(long, env = "UPDATE_WORKER_POLL_INTERVAL", default_value_t = 10)]
    pub update_poll_interval: u64,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Channel events are fanned out on
    #[arg(long, env = "REDIS_CHANNEL", default_value = "skyblock-events")]
    pub redis_channel: String,

    /// Bearer key protecting the admin routes
    #[arg(long, env = "ADMIN_API_KEY")]
    pub admin_key: String,
}
