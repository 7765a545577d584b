// Defect detection pipeline: algorithms and polling workers

pub mod annotate;
pub mod classifier;
pub mod codec;
pub mod detection;
pub mod detection_worker;
pub mod geometry;
pub mod orchestrator;
pub mod reader;
pub mod rollmap;
pub mod slicing;
pub mod store;
pub mod two_pass;
pub mod types;
