pub mod live;
pub mod loader;
pub mod schema;

pub use live::{ConfigChange, ConfigWatcher, SharedConfig};
pub use loader::{default_config_path, load_config, load_config_from_str};
pub use schema::{CollisionPolicy, Config, WatchConfig};
