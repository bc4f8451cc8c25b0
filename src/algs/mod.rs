//! Communication substrate: transports, wire records and collectives.

pub mod collective;
pub mod communicator;
pub mod exchange;
pub mod wire;

pub use collective::{allgather_records, allgather_u64, allreduce_sum_u64, exclusive_offsets};
pub use communicator::{CommTag, Communicator, NoComm, RayonComm, Wait};
pub use exchange::exchange_records;
