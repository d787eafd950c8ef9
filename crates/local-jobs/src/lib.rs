//! Run paperflow tools as normal processes on the local machine.

pub mod spawner;

pub use spawner::{LocalSpawnedTask, LocalSpawner};
