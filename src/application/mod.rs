//! Collaborator seams: the executor being decorated, the SQL grammar and the
//! relation graph.

pub mod executor;
pub mod grammar;
pub mod relations;

pub use executor::{ExecutorError, QueryExecutor};
pub use grammar::{CompiledQuery, Grammar, GrammarError, StandardGrammar};
pub use relations::{RelationDef, RelationGraph, StaticRelationGraph};
