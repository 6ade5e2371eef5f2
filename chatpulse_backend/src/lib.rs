pub mod config;
pub mod database;
pub mod dice;
pub mod engine;
pub mod events;
pub mod group;
pub mod http_client;
pub mod ledger;
pub mod llm_client;
pub mod memory;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod tags;
pub mod timers;

#[cfg(test)]
mod test_support;
