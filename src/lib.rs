pub mod coins;
pub mod config;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod output;
pub mod plan;
pub mod session;
pub mod stimuli;
