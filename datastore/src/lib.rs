#![deny(clippy::all)]

pub mod command;
pub mod domain;
pub mod ports;

pub use command::{Command, Reply};
pub use domain::{Entry, Key, Query, QueryResults, Value};
pub use ports::{Batch, Batching, Connection, Datastore};
