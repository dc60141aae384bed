// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Every payload crossing the broker is carried as a JSON array holding exactly
//! one element. Scalars and objects alike keep the same structural wrapper.

use crate::errors::AmqpError;
use serde::Serialize;
use serde_json::Value;

/// Wraps `payload` into `[payload]` and serializes it to bytes.
pub fn encode<T>(payload: &T) -> Result<Vec<u8>, AmqpError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(&[payload]).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}

/// Parses the raw envelope and returns its first element.
pub fn decode(data: &[u8]) -> Result<Value, AmqpError> {
    let envelope: Vec<Value> =
        serde_json::from_slice(data).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

    envelope
        .into_iter()
        .next()
        .ok_or_else(|| AmqpError::ParsePayloadError("empty envelope".to_owned()))
}
