/// Island data file injected into every container so the in-game mod knows
/// which team (or legacy solo player) owns the server.
pub const ISLAND_DATA_PATH: &str =
    "/opt/minecraft/world/serverconfig/skyblock_island_data.toml";

/// Player-sync configuration rendered from a template at clone time.
pub const PLAYERSYNC_CONFIG_PATH: &str = "/opt/minecraft/config/playersync-common.toml";

/// World data directory archived and restored by the image update strategy.
pub const ISLAND_DATA_DIR: &str = "/opt/minecraft/world";

/// Default Minecraft port inside the container.
pub const DEFAULT_MC_PORT_INTERNAL: u16 = 25565;

/// Key used for the startup leader election in the bus key store.
pub const STARTUP_LOCK_KEY: &str = "skyblock:startup_lock";
