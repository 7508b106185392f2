pub mod app;
pub mod config;
pub mod convert;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod index;
pub mod output;
pub mod reference;
pub mod remote;
pub mod resolve;
pub mod store;
pub mod taiga_http;
