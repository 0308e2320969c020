// Copyright (c) Facebook, Inc. and its affiliates.
mod args;
mod treatment;

pub use args::Args;
pub use treatment::{workload_tags, ConfigSpace, EngineKind, Treatment};
