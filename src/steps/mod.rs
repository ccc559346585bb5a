pub mod deserialize;
pub mod input;
pub mod output;
pub mod script;
pub mod serialize;
