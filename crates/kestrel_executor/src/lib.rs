pub mod column_ops;
pub mod columnar;
pub mod engine;
pub mod executor;
pub mod hash_join;
pub mod memory;
pub mod result;
pub mod source;

pub use columnar::{Column, ColumnData, ColumnarTable};
pub use engine::QueryEngine;
pub use executor::{Executor, StepFuture};
pub use memory::MemoryDataSource;
pub use result::IntermediateQueryResult;
pub use source::{DataSourceClient, SqlBackend, SqlDataSource};
