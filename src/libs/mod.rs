pub mod config;
pub mod controller;
pub mod design;
pub mod diff;
pub mod engine;
pub mod error;
pub mod event;
pub mod io;
pub mod ledger;
pub mod model;
pub mod motif;
pub mod output;
pub mod pipeline;
pub mod plot;
pub mod proximity;
pub mod region;
pub mod report;
pub mod significance;
