pub mod errors;

pub use errors::{DispatchError, LinkError, LinkResult};
