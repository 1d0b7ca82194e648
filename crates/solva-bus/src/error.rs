// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Failure decoding or encoding a bus message at the wire boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bus message is not a JSON object")]
    NotAnObject,

    #[error("malformed bus message: {0}")]
    Malformed(String),
}

/// Transport or protocol failure talking to the bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connection(String),

    #[error("bus command failed: {0}")]
    Command(String),

    #[error("bus unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}
