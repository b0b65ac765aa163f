pub mod builder;
pub mod chunks;
pub mod cli;
pub mod comparison;
pub mod components;
pub mod db;
pub mod diff;
pub mod error;
pub mod index;
pub mod model;
pub mod report;
pub mod sessions;
pub mod storage;
pub mod tree;
