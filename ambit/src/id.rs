/// Identifier of a vertex/worker. Assigned by the coordinator from the node
/// set of the supplied graph; also used as the tie-break key in the leader
/// elections and in Ricart-Agrawala.
pub type NodeId = u64;

/// Per-peer sequence number used in FIFO mode.
pub type SeqNumber = u64;
