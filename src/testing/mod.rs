//! Scripted components for exercising the coordinator without a camera.
pub mod mocks;
