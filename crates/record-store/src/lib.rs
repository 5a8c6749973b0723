//! Record model, query descriptors and database access.
//!
//! This crate is the non-cached side of the record store:
//! - [`Query`] and [`Predicate`] describe what to read
//! - [`RecordDatabase`] executes reads against PostgreSQL or memory
//! - [`TypeRegistry`] and [`ObjectReconstructor`] turn rows into objects

pub mod error;
pub mod memory;
pub mod object_type;
pub mod postgres;
pub mod query;
pub mod reconstruct;
pub mod record;
pub mod store;

pub use common::{RecordId, TypeId};
pub use error::{RecordStoreError, Result};
pub use memory::InMemoryRecordDatabase;
pub use object_type::{InMemoryTypeRegistry, ObjectType, TypeRegistry, admits};
pub use postgres::PostgresRecordDatabase;
pub use query::{Operator, Predicate, Query, SortOrder, Sorter};
pub use reconstruct::{ObjectReconstructor, RecordReconstructor, RecordView, materialize};
pub use record::{Attributes, DecodeError, DecodedRow, RawRow, Record};
pub use store::RecordDatabase;
