pub mod query;
pub mod row;
pub mod table;

pub use query::*;
pub use row::*;
pub use table::*;
