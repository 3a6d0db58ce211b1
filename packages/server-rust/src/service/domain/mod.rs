//! Domain microservices hosted by the `courier wrapper` binary.

mod counter;

pub use counter::GuessCounter;
