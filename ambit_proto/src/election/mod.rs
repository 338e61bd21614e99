// This module contains the three ring leader elections. All of them elect
// the minimum id: every node ends as the unique LEADER or as a FOLLOWER.

// This module contains the all-the-way election.
mod all_the_way;

// This module contains the as-far-as-it-can election.
mod as_far;

// This module contains the controlled-distance election.
mod controlled_distance;

// Re-exports.
pub use all_the_way::AllTheWay;
pub use as_far::AsFar;
pub use controlled_distance::ControlledDistance;
