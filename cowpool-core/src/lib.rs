// vim: tw=80

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// database::database is the natural home for the Database struct
#![allow(clippy::module_inception)]

pub mod cache;
pub mod config;
pub mod database;
pub mod dbuf;
pub mod dmu;
pub mod dsl;
pub mod label;
pub mod mirror;
pub mod pool;
pub mod property;
pub mod raidz;
pub mod send;
pub mod spacemap;
pub mod txg;
pub mod types;
pub mod util;
pub mod vdev;
pub mod vdev_file;
pub mod volume;
pub mod zio;

pub use crate::types::*;
pub use crate::util::*;
