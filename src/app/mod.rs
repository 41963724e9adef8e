//! Usage: Application layer (client context, CLI entry, terminal sink, logging, notices).

pub(crate) mod app_state;
pub(crate) mod cleanup;
pub(crate) mod cli;
pub(crate) mod logging;
pub(crate) mod notice;
pub(crate) mod terminal;
