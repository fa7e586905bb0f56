pub mod ai;
pub mod backend;
pub mod bookmarks;
pub mod catalog;
pub mod config;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod groups;
pub mod k8s;
pub mod model;
pub mod namespaces;
pub mod persist;
pub mod probe;
pub mod recent;
pub mod registry;
pub mod session;
pub mod state;
pub mod streaming;
pub mod watcher;

#[cfg(test)]
mod testing;
