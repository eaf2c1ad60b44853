pub mod audio;
pub mod cli;
pub mod dom;
pub mod library;
pub mod manifest;
pub mod merge;
pub mod patch;
pub mod pipeline;
pub mod texture;
