pub mod consensus;
pub mod extractor;
pub mod orchestrator;
pub mod render;
pub mod similarity;
