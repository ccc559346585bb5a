pub mod bridge;
pub mod convert;
pub mod managed_vars;
