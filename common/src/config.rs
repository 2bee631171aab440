// Version reported by every binary of the workspace: `<crate version>-<commit>`
pub const VERSION: &str = env!("BUILD_VERSION");

// Default UDP port of the discovery protocol
pub const DEFAULT_DISCOVERY_PORT: u16 = 2126;

// Default bind address of a bootnode, all interfaces on the discovery port
pub const DEFAULT_BOOTNODE_BIND_ADDRESS: &str = "0.0.0.0:2126";

// Name used for NAT port mappings and log files
pub const BOOTNODE_NAME: &str = "tos-bootnode";
