pub mod error;
pub mod registry;
pub mod source;
pub mod types;
pub mod utils;

pub use error::{
    SourceError,
    SourceResult,
};
pub use registry::SourceRegistry;
pub use source::{
    Source,
    SourceMetadata,
};
pub use types::{
    ChangeQuery,
    Cursor,
    FieldType,
    FieldValue,
    Record,
};
pub use utils::RetryPolicy;
