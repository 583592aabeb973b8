pub mod plan;
pub mod planner;
#[cfg(test)]
mod tests;

pub use plan::{QueryStep, VALUE_COLUMN};
pub use planner::{PhysicalPlanner, DELTA_COLUMN, DIFF_COLUMN};
