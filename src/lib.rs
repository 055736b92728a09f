pub mod arrival;
pub mod bench;
pub mod client;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod inputs;
pub mod load_gen;
pub mod logging;
pub mod metrics;
pub mod mock_service;
pub mod pipeline;
pub mod protocol;
pub mod replica;
pub mod stats;
pub mod transport;

pub use client::{AsyncClient, ClientConfig, RequestId};
pub use error::{ClientError, ClientResult};
pub use pipeline::{PipelineExecutor, StageGraph, StageSpec};
pub use protocol::{Outcome, Payload};
pub use stats::{StatsAggregator, StatsSnapshot};
