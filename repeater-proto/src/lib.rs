/// Generated gRPC code from proto/bus.proto
pub mod proto {
    tonic::include_proto!("repeater.bus");
}

// Re-export commonly used types at the crate root for convenience
pub use proto::repeater_bus_client::RepeaterBusClient;
pub use proto::repeater_bus_server::{RepeaterBus, RepeaterBusServer};

pub use proto::{BusFrame, FrameKind};
