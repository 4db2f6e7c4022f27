pub mod error;
pub mod record;
pub mod value;

pub use error::{DbError, ErrorCode, Result};
pub use record::{ChildSlot, ID_FIELD, Record};
pub use value::Value;
