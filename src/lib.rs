pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod election;
pub mod engine;
pub mod error;
pub mod grpc;
pub mod intake;
pub mod leader;
pub mod logging;
pub mod membership;
pub mod node;
pub mod partition;
pub mod permit;
pub mod relay;
pub mod score;
pub mod shutdown;
pub mod tls;

pub use error::{Result, SchedError};

// Generated protobuf types for the peer service.
pub mod proto {
    tonic::include_proto!("podrelay");

    impl PodSpec {
        /// `"<namespace>/<name>"`: identifies a pod to the score
        /// aggregator and selects its aggregation target.
        pub fn key(&self) -> String {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}
