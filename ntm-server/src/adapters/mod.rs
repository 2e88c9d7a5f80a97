pub mod checkpoints;
pub mod cli;
pub mod fs;
pub mod jwks;
pub mod kernel;
pub mod mail;
pub mod process;
pub mod sqlite;
pub mod tools;
