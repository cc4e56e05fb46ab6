// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel diagnostics: structured logging and memory map dumps.

#[macro_use]
pub mod log;
pub mod memshow;
