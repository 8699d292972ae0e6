//! Storage admission policy: each node decides locally which
//! fanned-out blocks it keeps. The coordinator never pre-selects
//! targets; replication emerges from the acceptance probabilities of
//! the node pool.

use rand::Rng;

/// Decision of the admission policy for one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
	/// Block already on disk, accept again (idempotent)
	AlreadyStored,
	/// Keep the block
	Accept,
	/// Keeping the block would cross the free-space floor
	Refuse,
	/// The balancing draw went against keeping the block
	Decline,
}

#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
	pub capacity: u64,
	/// Fraction of the capacity that must stay free
	pub min_free_ratio: f64,
	/// Base acceptance probability, scaled down as the node fills
	pub accept_probability: f64,
}

impl AdmissionPolicy {
	/// Decide whether to keep a block of `block_size` bytes given the
	/// current accounting. The acceptance probability is
	/// `P * (1 - used/capacity)`, so a filling node drifts towards
	/// declining everything.
	pub fn evaluate<R: Rng>(
		&self,
		already_stored: bool,
		block_size: u64,
		used: u64,
		rng: &mut R,
	) -> Admission {
		if already_stored {
			return Admission::AlreadyStored;
		}

		let free_floor = self.capacity as f64 * self.min_free_ratio;
		if (self.capacity as f64) - (used as f64) - (block_size as f64) < free_floor {
			return Admission::Refuse;
		}

		let used_ratio = (used as f64 / self.capacity as f64).min(1.0);
		let p = self.accept_probability * (1.0 - used_ratio);
		if rng.gen::<f64>() < p {
			Admission::Accept
		} else {
			Admission::Decline
		}
	}
}
