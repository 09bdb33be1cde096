pub mod interpolation;
pub mod loader;
pub mod schema;
pub mod validation;

pub use interpolation::interpolate;
pub use loader::{
    ConfigLoadError,
    ConfigLoadResult,
    ConfigLoader,
};
pub use schema::{
    GeneralConfig,
    PostgresConfig,
    SourceAdapterConfig,
    SourceConfig,
    SqliteSourceConfig,
    StorageBackend,
    StorageConfig,
    TidemarkConfig,
};
pub use validation::{
    ConfigValidation,
    ConfigValidator,
};
