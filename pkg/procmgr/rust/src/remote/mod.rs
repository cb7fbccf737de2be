// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Both ends of a launcher connection: [`RemoteConnection`] on the
//! controller side, [`serve`] on the launcher side.

mod connection;
mod launcher;

pub use connection::{RemoteConnection, RemoteStatus};
pub use launcher::{HALT_TIMEOUT, RemoteIdleDelegate, serve};
