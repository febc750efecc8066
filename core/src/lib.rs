//! Core pipeline for riff: natural-language (or direct JSON) requests
//! become validated, reversible patches against a live performance
//! session.
//!
//! The path of a turn is fixed: [`router`] decides whether the input is
//! a literal command batch or a prompt for the [`backend`] chain; the
//! candidate batch goes through [`normalize`] (shape repair, with
//! notes), [`validate`] (closed safety tables, all-or-nothing), [`emit`]
//! (structural translation), and [`apply`] (atomic application plus
//! revert computation). [`turn::LiveSession`] orchestrates the stages
//! and records everything through [`store`].

pub mod apply;
pub mod backend;
pub mod config;
pub mod emit;
pub mod error;
pub mod events;
pub mod normalize;
pub mod router;
pub mod runtime;
pub mod session;
pub mod store;
pub mod troubleshoot;
pub mod turn;
pub mod validate;

pub use config::{BackendKind, Config};
pub use error::{Result, RiffError};
pub use turn::LiveSession;
