//! Cross-module flow tests and shared test fixtures.

pub(crate) mod support;
