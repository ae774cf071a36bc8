//! Domain model module declarations.

pub mod account;
pub mod health;
pub mod instance;
pub mod worker;
