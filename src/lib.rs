// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Access-controlled, multi-context Kubernetes client layer.
//!
//! Resource policy is enforced at discovery and mapping time, so denied
//! types are never fetched or addressed. Client bundles are cached per
//! context and configuration reloads swap in a complete new generation.

pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod kubernetes;
pub mod logging;
pub mod reload;

pub use error::{GateError, Result};
pub use gateway::{Gateway, Generation, RequestScope};
