pub mod admission;
pub mod batch;
pub mod orchestrator;
pub mod runner;
pub mod storage;
pub mod types;

#[cfg(test)]
mod tests;
