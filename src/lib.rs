pub mod about;
pub mod allocation;
pub mod config;
pub mod error;
pub mod ledger;
pub mod pcr_import;
pub mod pipeline;
pub mod qualification;
pub mod sample;
pub mod unsat;
pub mod worklist;
