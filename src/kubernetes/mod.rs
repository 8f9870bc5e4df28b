// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

mod client;
mod resources;

pub use client::{KubeSource, connect};
pub use resources::ResourceKind;
