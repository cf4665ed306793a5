//! Request decorators that attach credentials.

mod bearer;

pub use bearer::Authorized;
