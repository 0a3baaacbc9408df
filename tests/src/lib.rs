//! Test-only crate aggregating unit and integration coverage for the
//! workspace: core IR, backend codegen, frontend translation, the
//! execution loop and linux-user harness.

mod backend;
mod core;
mod exec;
mod integration;
mod linux_user;
