//! Query and result types shared by every layer.

pub mod entity;
pub mod operation;
pub mod output;
pub mod query;
pub mod value;

pub use entity::{ConnectionId, Entity};
pub use operation::{Column, ReadOperation, WriteOperation};
pub use output::{Page, Plucked, QueryOutput};
pub use query::{Boolean, Direction, OrderClause, Predicate, QueryDescriptor, WhereClause};
pub use value::{Expression, Pivot, PivotParent, Row, Value};
