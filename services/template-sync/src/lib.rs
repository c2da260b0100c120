pub mod api;
pub mod bitcoind;
pub mod cache;
pub mod catcher;
pub mod coinbase;
pub mod config;
pub mod devnet;
pub mod error;
pub mod gateway;
pub mod longpoll;
pub mod miner;
pub mod pow;
pub mod primitives;
pub mod search;
pub mod service;
pub mod template;

pub use error::{MiningError, MiningResult};
pub use service::{Engine, MiningService, ServiceSettings};
