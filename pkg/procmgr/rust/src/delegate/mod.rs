// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Match and rewrite delegates attached to factories.

mod gdb_rewrite;
mod info_match;
mod key_match;

pub use gdb_rewrite::{DEFAULT_DEBUGGER, GdbRewriteDelegate};
pub use info_match::InfoMatchDelegate;
pub use key_match::KeyMatchDelegate;

use crate::info::ProcessInfo;

/// Predicate deciding whether a factory handles a specification.
pub trait MatchDelegate: Send + Sync {
    fn matches(&self, info: &ProcessInfo) -> bool;
}

/// Mutates a factory's private copy of a specification.
pub trait RewriteDelegate: Send + Sync {
    fn rewrite(&self, info: &mut ProcessInfo);
}
