// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

pub mod access;
pub mod client;
pub mod context;
pub mod discovery;
pub mod gate;
pub mod mapper;
pub mod policy;
pub mod validation;

pub use access::{AccessAttributes, AccessReviewer};
pub use client::{ClientBundle, ClientFactory, KubeClientFactory};
pub use context::{ContextInfo, ContextManager, IN_CLUSTER_CONTEXT};
pub use discovery::{DiscoveredType, FilteredDiscovery};
pub use gate::{ApiPath, GatedService, RequestGate};
pub use mapper::FilteredRestMapper;
pub use policy::PolicySet;
pub use validation::{ValidationCode, ValidationError};
