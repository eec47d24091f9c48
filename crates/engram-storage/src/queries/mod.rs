// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed query modules, one per infrastructure table.

pub mod embedding_cache;
pub mod queue;
pub mod turns;
