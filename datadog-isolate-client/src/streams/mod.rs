// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Credit-controlled half-streams: download receivers (daemon to client)
//! and upload sessions (client to daemon).

pub(crate) mod download;
pub(crate) mod upload;

pub use download::ResponseBody;
pub use upload::ByteStream;

/// Upper bound for a single body chunk frame; larger reads are split.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Credit granted on download start and replenished on each consumer pull.
pub const DEFAULT_STREAM_CREDIT: u64 = 256 * 1024;

/// Bodies at or above this size, or of unknown size, stream instead of
/// being inlined into a single frame.
pub const BODY_STREAM_THRESHOLD: u64 = 1024 * 1024;
