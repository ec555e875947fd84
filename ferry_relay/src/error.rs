// Process-level relay errors. Everything that fails inside one session pair
// stays in `pair::PairError`; these are the failures that end the process.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("accepting clients failed: {0}")]
    Accept(#[source] io::Error),

    #[error("cannot start relay thread: {0}")]
    Spawn(#[source] io::Error),
}
