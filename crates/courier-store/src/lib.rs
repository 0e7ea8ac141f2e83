pub mod database;
pub mod error;
pub mod queue;
pub mod row_helpers;
pub mod schema;
pub mod templates;
pub mod windows;

pub use database::Database;
pub use error::StoreError;
pub use queue::{QueueCounts, QueueEntry, QueueRepo, QueueStatus};
pub use templates::{NewTemplate, TemplateRepo, TemplateRow, TemplateStatus};
pub use windows::{ContactMeta, WindowRepo, WindowRow, WindowStatus};
