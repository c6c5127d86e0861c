pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod report;
pub mod row;
pub mod runs;
pub mod schema;
pub mod table;

pub use backend::{InsertAllResponse, InsertRequestOptions, LocalStore, StreamingBackend};
pub use error::{ApiError, InsertError, PartialFailureError, Result};
pub use pipeline::batch::BatchLimits;
pub use pipeline::executor::{Delivery, FlushEvent, FlushListener};
pub use pipeline::provision::ProvisionPolicy;
pub use pipeline::queue::{InsertQueue, QueueOptions};
pub use row::InsertRow;
pub use schema::TableSchema;
pub use table::{InsertRowsOptions, Table, TableRef};
