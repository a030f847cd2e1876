// Базовые модули
pub mod config;
pub mod consts;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod util; // src/util/mod.rs

// Durable Store (src/store/mod.rs)
pub mod store;

// Тома, провайдеры и поток различий
pub mod provider; // src/provider/{mod,fs,diff}.rs
pub mod volume;

// Оркестратор
pub mod manager;

// Удобные реэкспорты
pub use config::{FsProviderConfig, ManagerConfig};
pub use error::{Result, VolumeError};
pub use manager::Manager;
pub use provider::{
    restore_provider, BootstrapRecord, FsProvider, Haves, Marker, ProvidedVolume, Provider,
    SendOptions,
};
pub use volume::{Volume, VolumeInfo};
