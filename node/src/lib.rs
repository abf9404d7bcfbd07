// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod config;
pub mod errors;
pub mod telemetry;
pub mod source;
pub mod connector;
pub mod runtime;

pub use config::NodeConfig;
pub use connector::{Delivery, Sink};
pub use errors::{NodeError, NodeResult};
pub use runtime::{ConnectorRuntime, DeliverySettings};
pub use source::EventSource;
