pub mod adapters;
pub mod run;
pub mod validate;
