//! Tierio Protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for the Tierio master's
//! client-facing and worker-facing gRPC services.

/// Block master services (client and worker facing)
pub mod master {
    tonic::include_proto!("tierio.master");
}
