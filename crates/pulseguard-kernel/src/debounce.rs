//! [`Debouncer`] – the one filter primitive shared by every interlock.
//!
//! # Algorithm
//!
//! The debouncer holds a *stable* output and counts how many consecutive raw
//! samples have disagreed with it. Once that count reaches the policy's
//! threshold the output flips and the count resets. A single agreeing sample
//! in between resets the count, so transient noise never flips the output.
//!
//! [`DebouncePolicy::Instant`] has a threshold of one: every raw change is
//! passed straight through. The initial output is `false` (unsatisfied) for
//! every policy.
//!
//! # Example
//!
//! ```rust
//! use pulseguard_kernel::debounce::{DebouncePolicy, Debouncer};
//!
//! let mut d = Debouncer::new(DebouncePolicy::Consecutive(2));
//! assert!(!d.update(true));
//! assert!(d.update(true));   // second agreeing sample → satisfied
//! assert!(d.update(false));  // one failing sample is noise
//! assert!(!d.update(false)); // second one flips
//! ```

/// How many consistent samples a change needs before it is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebouncePolicy {
    /// Pass every change through immediately.
    Instant,
    /// Require `n` consecutive consistent samples. `n` of 0 or 1 behaves
    /// like [`DebouncePolicy::Instant`].
    Consecutive(u32),
}

impl DebouncePolicy {
    fn threshold(self) -> u32 {
        match self {
            DebouncePolicy::Instant => 1,
            DebouncePolicy::Consecutive(n) => n.max(1),
        }
    }
}

/// Symmetric N-consecutive-sample filter over a boolean signal.
#[derive(Debug, Clone)]
pub struct Debouncer {
    policy: DebouncePolicy,
    stable: bool,
    disagreeing: u32,
}

impl Debouncer {
    /// Create a debouncer whose output starts unsatisfied.
    pub fn new(policy: DebouncePolicy) -> Self {
        Self {
            policy,
            stable: false,
            disagreeing: 0,
        }
    }

    /// Feed one raw sample and return the filtered output.
    pub fn update(&mut self, raw: bool) -> bool {
        if raw == self.stable {
            self.disagreeing = 0;
            return self.stable;
        }
        self.disagreeing += 1;
        if self.disagreeing >= self.policy.threshold() {
            self.stable = raw;
            self.disagreeing = 0;
        }
        self.stable
    }

    /// Current filtered output.
    pub fn output(&self) -> bool {
        self.stable
    }
}
