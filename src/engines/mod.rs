//! Solver engine implementations.

pub mod feynman_kac;
pub mod hjb;
pub mod kfe;
pub mod monte_carlo;

pub use feynman_kac::FeynmanKacMpc;
pub use hjb::{HjbSolution, HjbSolver};
pub use kfe::{KfeSolver, StationaryDistribution};
pub use monte_carlo::McMpcSimulator;
