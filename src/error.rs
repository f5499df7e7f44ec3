//! Crate-wide error type, composed from each subsystem's own `snafu` enum.
//!
//! Each module defines its own narrow `Error` (see [`crate::config::Error`],
//! [`crate::template::Error`], ...); this module only stitches them together
//! so that `main` has a single type to match on and turn into an exit code.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("configuration error: {source}"), context(false))]
    Config { source: crate::config::Error },

    #[snafu(display("template error: {source}"), context(false))]
    Template { source: crate::template::Error },

    #[snafu(display("value loader error: {source}"), context(false))]
    Loader { source: crate::loaders::Error },

    #[snafu(display("decryption error: {source}"), context(false))]
    Decryptor { source: crate::decryptor::Error },

    #[snafu(display("crypto error: {source}"), context(false))]
    Crypto { source: crate::crypto::Error },

    #[snafu(display("object merge error: {source}"), context(false))]
    Merge { source: crate::merge::Error },

    #[snafu(display("state store error: {source}"), context(false))]
    State { source: crate::state::Error },

    #[snafu(display("reconcile error: {source}"), context(false))]
    Reconcile { source: crate::reconciler::Error },

    #[snafu(display("cluster API error: {source}"), context(false))]
    Cluster { source: crate::cluster::Error },

    #[snafu(display("bundle error: {source}"), context(false))]
    Bundle { source: crate::bundle::Error },

    #[snafu(display("{message}"))]
    Other { message: String },
}

impl Error {
    pub fn other(message: impl Into<String>) -> Self {
        Error::Other {
            message: message.into(),
        }
    }
}
