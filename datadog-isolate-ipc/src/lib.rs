// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire layer for the isolate daemon protocol: typed messages, the
//! length-prefixed frame codec, and the framed transport used by the client.

pub mod codec;
pub mod msg;
pub mod platform;
pub mod transport;

pub use rmpv;
